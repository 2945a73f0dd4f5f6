//! Calling principal, as delivered by the fronting authentication layer.
//!
//! The gateway never performs authentication itself; the host in front of it
//! resolves the caller and forwards identity claims in headers. A request
//! with no principal name header is unauthenticated.

use http::{HeaderMap, Method};

use crate::config::AccessConfig;

pub const PRINCIPAL_NAME_HEADER: &str = "x-ms-client-principal-name";
pub const PRINCIPAL_ID_HEADER: &str = "x-ms-client-principal-id";
pub const PRINCIPAL_TENANT_HEADER: &str = "x-ms-client-principal-tenant";
pub const PRINCIPAL_ROLES_HEADER: &str = "x-ms-client-roles";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub id: Option<String>,
    pub tenant: String,
    pub roles: Vec<String>,
}

impl Principal {
    /// Extracts the principal from front-door headers; `None` when the
    /// request is unauthenticated.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let name = header_str(headers, PRINCIPAL_NAME_HEADER)?;
        if name.is_empty() {
            return None;
        }
        let roles = header_str(headers, PRINCIPAL_ROLES_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name: name.to_string(),
            id: header_str(headers, PRINCIPAL_ID_HEADER).map(String::from),
            tenant: header_str(headers, PRINCIPAL_TENANT_HEADER)
                .unwrap_or_default()
                .to_string(),
            roles,
        })
    }

    pub fn is_in_any_role(&self, roles: &[String]) -> bool {
        self.roles.iter().any(|have| roles.contains(have))
    }

    pub fn is_admin(&self, access: &AccessConfig) -> bool {
        self.is_in_any_role(&access.admin_roles)
    }

    /// Reader/writer gate: GET needs a reader role, every other verb a
    /// writer role; admins pass both.
    pub fn authorize(&self, method: &Method, access: &AccessConfig) -> Result<(), String> {
        if self.is_admin(access) {
            return Ok(());
        }
        if *method == Method::GET {
            if self.is_in_any_role(&access.reader_roles) {
                Ok(())
            } else {
                Err("principal must be in a reader role to access".into())
            }
        } else if self.is_in_any_role(&access.writer_roles) {
            Ok(())
        } else {
            Err("principal must be in a writer role to update".into())
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
