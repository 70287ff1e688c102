//! # Transaction Schema
//!
//! Typed representation of a single transaction record plus the two codecs
//! the pipeline needs:
//!
//! - **Delimited records** (CSV field tuples) → [`Transaction::parse`]
//! - **Wire messages** (JSON, UTF-8) ↔ [`encode`] / [`decode`]
//!
//! ## Wire format
//!
//! ```json
//! {
//!   "id": "tx-0001",
//!   "date": "2024-03-01T12:30:00Z",
//!   "document": "123.456.789-00",
//!   "name": "Maria Silva",
//!   "age": 34,
//!   "amount": 250.75,
//!   "installments": 3
//! }
//! ```
//!
//! Field order is fixed by declaration order, so encoding is deterministic.
//! Decoding also accepts `transactionId` for `id` and `clientId` for
//! `document`, which older producers emitted.
//!
//! `id` is the idempotency key for the whole pipeline: two transactions with
//! the same `id` are the same logical event, whatever their other fields say.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

mod error;

pub use error::{CodecError, Field, ParseError, ParseErrorReason};

/// Number of columns a delimited record must carry
pub const FIELD_COUNT: usize = 7;

/// Content type of the wire representation
pub const CONTENT_TYPE: &str = "application/json";

/// A single transaction record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Globally unique identity, the conflict key downstream
    #[serde(alias = "transactionId")]
    pub id: String,

    /// When the transaction happened (RFC 3339 on the wire)
    pub date: DateTime<Utc>,

    /// Client document / identity
    #[serde(alias = "clientId")]
    pub document: String,

    pub name: String,

    pub age: u32,

    pub amount: f64,

    /// Always at least 1
    pub installments: u32,
}

impl Transaction {
    /// Parse a delimited record, in column order
    /// `id; date; document; name; age; amount; installments`.
    ///
    /// Columns past the seventh are ignored. The record is rejected as a whole
    /// on the first problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use transaction_schema::Transaction;
    ///
    /// let tx = Transaction::parse(&[
    ///     "tx-1", "2024-03-01T12:30:00Z", "123", "Maria", "34", "250.75", "3",
    /// ])
    /// .unwrap();
    /// assert_eq!(tx.installments, 3);
    /// ```
    pub fn parse<S: AsRef<str>>(fields: &[S]) -> Result<Self, ParseError> {
        if fields.len() < FIELD_COUNT {
            return Err(ParseError::MissingField {
                found: fields.len(),
            });
        }

        let id = column(fields, Field::Id).trim();
        if id.is_empty() {
            return Err(ParseError::BlankField { field: Field::Id });
        }

        let age: u32 = convert(column(fields, Field::Age), Field::Age)?;

        let amount: f64 = convert(column(fields, Field::Amount), Field::Amount)?;
        if !amount.is_finite() {
            return Err(conversion(Field::Amount, column(fields, Field::Amount)));
        }

        let installments: u32 = convert(column(fields, Field::Installments), Field::Installments)?;
        if installments == 0 {
            return Err(conversion(Field::Installments, column(fields, Field::Installments)));
        }

        let raw_date = column(fields, Field::Date).trim();
        let date = DateTime::parse_from_rfc3339(raw_date)
            .map_err(|source| ParseError::InvalidDate {
                value: raw_date.to_string(),
                source,
            })?
            .with_timezone(&Utc);

        Ok(Self {
            id: id.to_string(),
            date,
            document: column(fields, Field::Document).to_string(),
            name: column(fields, Field::Name).to_string(),
            age,
            amount,
            installments,
        })
    }

    /// Check the invariants serde cannot express on its own
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.id.trim().is_empty() {
            return Err(ParseError::BlankField { field: Field::Id });
        }
        if self.installments == 0 {
            return Err(conversion(Field::Installments, "0"));
        }
        if !self.amount.is_finite() {
            return Err(conversion(Field::Amount, &self.amount.to_string()));
        }
        Ok(())
    }
}

/// Serialize to the canonical wire representation
pub fn encode(transaction: &Transaction) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(transaction)?)
}

/// Deserialize a wire message and validate it
pub fn decode(body: &[u8]) -> Result<Transaction, CodecError> {
    let transaction: Transaction = serde_json::from_slice(body)?;
    transaction.validate()?;
    Ok(transaction)
}

fn column<S: AsRef<str>>(fields: &[S], field: Field) -> &str {
    fields[field.index()].as_ref()
}

fn convert<T: FromStr>(raw: &str, field: Field) -> Result<T, ParseError> {
    raw.trim().parse().map_err(|_| conversion(field, raw))
}

fn conversion(field: Field, raw: &str) -> ParseError {
    ParseError::FieldConversion {
        field,
        value: raw.to_string(),
    }
}
