//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Entry point addresses parse and do not collide
//! - Provider references point at something that exists
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: StaticConfig → Result<(), Vec<ValidationError>>

use std::collections::HashMap;

use crate::config::schema::StaticConfig;
use crate::net::proxy_protocol::TrustedIps;

/// A single semantic problem in the static configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("entry point '{name}': {reason}")]
    InvalidAddress { name: String, reason: String },

    #[error("entry points '{first}' and '{second}' share address {address}")]
    DuplicateAddress {
        first: String,
        second: String,
        address: String,
    },

    #[error("entry point '{name}': invalid trusted IP '{value}'")]
    InvalidTrustedIp { name: String, value: String },

    #[error("file provider needs exactly one of filename or directory")]
    FileProviderSource,
}

pub fn validate_config(config: &StaticConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen: HashMap<String, String> = HashMap::new();

    for (name, ep) in &config.entry_points {
        match ep.parse_address() {
            Ok((addr, proto)) => {
                let key = format!("{}/{:?}", addr, proto);
                if let Some(first) = seen.insert(key, name.clone()) {
                    errors.push(ValidationError::DuplicateAddress {
                        first,
                        second: name.clone(),
                        address: addr.to_string(),
                    });
                }
            }
            Err(reason) => errors.push(ValidationError::InvalidAddress {
                name: name.clone(),
                reason,
            }),
        }

        if let Some(pp) = &ep.proxy_protocol {
            for value in &pp.trusted_ips {
                if TrustedIps::new(std::slice::from_ref(value)).is_err() {
                    errors.push(ValidationError::InvalidTrustedIp {
                        name: name.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
    }

    if let Some(file) = &config.providers.file {
        if file.filename.is_some() == file.directory.is_some() {
            errors.push(ValidationError::FileProviderSource);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
