/*
    schema.rs - Closed set of entity kinds and their field schemas

    Every entity kind declares its fields up front. Values are type checked
    against the schema before they are encrypted, so a ciphertext always
    decodes to the declared type.
*/

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::EntityId;
use crate::errors::{VaultError, VaultResult};

/// Kinds of record the vault stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Transaction,
    Contact,
    Invoice,
}

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Money,
    Integer,
    Date,
    Boolean,
    Reference,
}

/// One field of an entity schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
}

const fn field(name: &'static str, field_type: FieldType) -> FieldSpec {
    FieldSpec { name, field_type }
}

const ACCOUNT_FIELDS: &[FieldSpec] = &[
    field("name", FieldType::Text),
    field("account_number", FieldType::Text),
    field("account_type", FieldType::Text),
    field("opening_balance", FieldType::Money),
    field("archived", FieldType::Boolean),
];

const TRANSACTION_FIELDS: &[FieldSpec] = &[
    field("description", FieldType::Text),
    field("amount", FieldType::Money),
    field("posted_on", FieldType::Date),
    field("account", FieldType::Reference),
    field("counterparty", FieldType::Reference),
    field("memo", FieldType::Text),
    field("voided_reason", FieldType::Text),
    field("reconciled", FieldType::Boolean),
];

const CONTACT_FIELDS: &[FieldSpec] = &[
    field("display_name", FieldType::Text),
    field("email", FieldType::Text),
    field("phone", FieldType::Text),
    field("tax_id", FieldType::Text),
];

const INVOICE_FIELDS: &[FieldSpec] = &[
    field("number", FieldType::Text),
    field("customer", FieldType::Reference),
    field("total", FieldType::Money),
    field("due_on", FieldType::Date),
    field("status", FieldType::Text),
    field("line_count", FieldType::Integer),
    field("notes", FieldType::Text),
];

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Account,
        EntityKind::Transaction,
        EntityKind::Contact,
        EntityKind::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Transaction => "transaction",
            EntityKind::Contact => "contact",
            EntityKind::Invoice => "invoice",
        }
    }

    pub fn parse(s: &str) -> VaultResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "account" => Ok(EntityKind::Account),
            "transaction" => Ok(EntityKind::Transaction),
            "contact" => Ok(EntityKind::Contact),
            "invoice" => Ok(EntityKind::Invoice),
            other => Err(VaultError::Validation(format!("unknown entity kind '{}'", other))),
        }
    }

    pub fn schema(&self) -> &'static [FieldSpec] {
        match self {
            EntityKind::Account => ACCOUNT_FIELDS,
            EntityKind::Transaction => TRANSACTION_FIELDS,
            EntityKind::Contact => CONTACT_FIELDS,
            EntityKind::Invoice => INVOICE_FIELDS,
        }
    }

    /// Look up a field, failing for names outside the schema
    pub fn field(&self, name: &str) -> VaultResult<&'static FieldSpec> {
        self.schema()
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| {
                VaultError::Validation(format!("{} has no field '{}'", self.as_str(), name))
            })
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FieldType {
    /// Types whose concurrent edits must always go to a human
    pub fn is_never_auto_merged(&self) -> bool {
        matches!(self, FieldType::Money | FieldType::Integer)
    }

    pub fn parse(s: &str) -> VaultResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(FieldType::Text),
            "money" => Ok(FieldType::Money),
            "integer" => Ok(FieldType::Integer),
            "date" => Ok(FieldType::Date),
            "boolean" => Ok(FieldType::Boolean),
            "reference" => Ok(FieldType::Reference),
            other => Err(VaultError::Validation(format!("unknown field type '{}'", other))),
        }
    }
}

/// Plaintext value of a field. Only ever held in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    /// Amount in minor units (cents) with an ISO 4217 currency code
    Money { amount_minor: i64, currency: String },
    Integer(i64),
    Date(NaiveDate),
    Boolean(bool),
    Reference(EntityId),
    /// Explicitly cleared
    Null,
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn money(amount_minor: i64, currency: &str) -> Self {
        FieldValue::Money {
            amount_minor,
            currency: currency.to_string(),
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            FieldValue::Text(_) => Some(FieldType::Text),
            FieldValue::Money { .. } => Some(FieldType::Money),
            FieldValue::Integer(_) => Some(FieldType::Integer),
            FieldValue::Date(_) => Some(FieldType::Date),
            FieldValue::Boolean(_) => Some(FieldType::Boolean),
            FieldValue::Reference(_) => Some(FieldType::Reference),
            FieldValue::Null => None,
        }
    }

    /// Check the value against a field declaration
    pub fn validate_for(&self, spec: &FieldSpec) -> VaultResult<()> {
        if let Some(actual) = self.field_type() {
            if actual != spec.field_type {
                return Err(VaultError::Validation(format!(
                    "field '{}' expects {:?}, got {:?}",
                    spec.name, spec.field_type, actual
                )));
            }
        }
        match self {
            FieldValue::Money { currency, .. } => {
                if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
                    return Err(VaultError::Validation(format!(
                        "field '{}': '{}' is not an ISO 4217 currency code",
                        spec.name, currency
                    )));
                }
            }
            FieldValue::Reference(id) if id.0.is_empty() => {
                return Err(VaultError::Validation(format!(
                    "field '{}': empty reference",
                    spec.name
                )));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> VaultResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::Money {
                amount_minor,
                currency,
            } => {
                let sign = if *amount_minor < 0 { "-" } else { "" };
                let abs = amount_minor.unsigned_abs();
                write!(f, "{}{}.{:02} {}", sign, abs / 100, abs % 100, currency)
            }
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Date(d) => write!(f, "{}", d),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Reference(id) => write!(f, "-> {}", id),
            FieldValue::Null => f.write_str("null"),
        }
    }
}
