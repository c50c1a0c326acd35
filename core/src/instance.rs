use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::token::Token;

/// One cluster node's membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub application: String,
    pub datacenter: String,
    pub rack: String,
    pub id: u32,
    pub instance_identifier: String,
    pub hostname: String,
    pub address: String,
    pub token: Token,
    pub updated_at: DateTime<Utc>,
}

/// Opaque store version used for compare-and-swap writes.
///
/// Versions come from a store-wide sequence and are never handed out twice,
/// so a record deleted and re-created never matches a stale read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value read from the store together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Arguments of a `create` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub application: String,
    pub datacenter: String,
    pub id: u32,
    pub instance_identifier: String,
    pub hostname: String,
    pub address: String,
    pub rack: String,
    /// Explicit token claim. `None` lets the engine compute one.
    pub token: Option<Token>,
}

impl CreateRequest {
    /// The record this request would create if it claims `token`.
    pub fn to_instance(&self, token: Token) -> Instance {
        Instance {
            application: self.application.clone(),
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
            id: self.id,
            instance_identifier: self.instance_identifier.clone(),
            hostname: self.hostname.clone(),
            address: self.address.clone(),
            token,
            updated_at: Utc::now(),
        }
    }
}

impl Instance {
    /// Copy of this record taken over by the host described in `request`.
    /// Token, datacenter and rack stay with the id.
    pub fn replaced_by(&self, request: &CreateRequest) -> Instance {
        Instance {
            instance_identifier: request.instance_identifier.clone(),
            hostname: request.hostname.clone(),
            address: request.address.clone(),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

const FIELDS: [&str; 9] = [
    "id",
    "instance_id",
    "app",
    "dc",
    "rack",
    "hostname",
    "address",
    "token",
    "updated",
];

/// Single-line `key=value` encoding used by the control surface.
impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} instance_id={} app={} dc={} rack={} hostname={} address={} token={} updated={}",
            self.id,
            urlencoding::encode(&self.instance_identifier),
            urlencoding::encode(&self.application),
            urlencoding::encode(&self.datacenter),
            urlencoding::encode(&self.rack),
            urlencoding::encode(&self.hostname),
            urlencoding::encode(&self.address),
            self.token,
            self.updated_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseInstanceError {
    #[error("expected field {expected:?}, found {found:?}")]
    UnexpectedField { expected: &'static str, found: String },
    #[error("missing field {0:?}")]
    MissingField(&'static str),
    #[error("trailing data after instance record")]
    TrailingData,
    #[error("invalid value for {field:?}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

impl FromStr for Instance {
    type Err = ParseInstanceError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.trim_end_matches('\n').split(' ');
        let mut values: Vec<Cow<'_, str>> = Vec::with_capacity(FIELDS.len());

        for field in FIELDS {
            let part = parts.next().ok_or(ParseInstanceError::MissingField(field))?;
            let (key, raw) = part.split_once('=').ok_or_else(|| {
                ParseInstanceError::UnexpectedField {
                    expected: field,
                    found: part.to_string(),
                }
            })?;
            if key != field {
                return Err(ParseInstanceError::UnexpectedField {
                    expected: field,
                    found: key.to_string(),
                });
            }
            let value = urlencoding::decode(raw).map_err(|_| ParseInstanceError::InvalidValue {
                field,
                value: raw.to_string(),
            })?;
            values.push(value);
        }
        if parts.next().is_some() {
            return Err(ParseInstanceError::TrailingData);
        }

        let invalid = |field: &'static str, value: &str| ParseInstanceError::InvalidValue {
            field,
            value: value.to_string(),
        };
        let id = values[0].parse::<u32>().map_err(|_| invalid("id", &values[0]))?;
        let token = values[7].parse::<Token>().map_err(|_| invalid("token", &values[7]))?;
        let updated_at = DateTime::parse_from_rfc3339(&values[8])
            .map_err(|_| invalid("updated", &values[8]))?
            .with_timezone(&Utc);

        Ok(Instance {
            id,
            instance_identifier: values[1].to_string(),
            application: values[2].to_string(),
            datacenter: values[3].to_string(),
            rack: values[4].to_string(),
            hostname: values[5].to_string(),
            address: values[6].to_string(),
            token,
            updated_at,
        })
    }
}
