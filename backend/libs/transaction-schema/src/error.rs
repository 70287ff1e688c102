//! Error types for transaction parsing and wire decoding

use std::fmt;
use thiserror::Error;

/// Column of a delimited transaction record, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Date,
    Document,
    Name,
    Age,
    Amount,
    Installments,
}

impl Field {
    /// Zero-based position of the column in a record
    pub fn index(self) -> usize {
        match self {
            Field::Id => 0,
            Field::Date => 1,
            Field::Document => 2,
            Field::Name => 3,
            Field::Age => 4,
            Field::Amount => 5,
            Field::Installments => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Id => "id",
            Field::Date => "date",
            Field::Document => "document",
            Field::Name => "name",
            Field::Age => "age",
            Field::Amount => "amount",
            Field::Installments => "installments",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a [`ParseError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorReason {
    MissingField,
    FieldConversion,
    InvalidDate,
}

/// A delimited record could not be turned into a [`crate::Transaction`].
///
/// Parsing is all-or-nothing: any of these rejects the whole record.
#[derive(Error, Debug)]
pub enum ParseError {
    /// Record is too short
    #[error("missing field: record has {found} fields, expected at least {}", crate::FIELD_COUNT)]
    MissingField { found: usize },

    /// Identity column is present but blank
    #[error("missing field: `{field}` is blank")]
    BlankField { field: Field },

    /// A numeric field could not be converted or is out of range
    #[error("field `{field}` could not be converted: {value:?}")]
    FieldConversion { field: Field, value: String },

    /// Date is not an RFC 3339 timestamp
    #[error("invalid date {value:?}: {source}")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

impl ParseError {
    pub fn reason(&self) -> ParseErrorReason {
        match self {
            ParseError::MissingField { .. } | ParseError::BlankField { .. } => {
                ParseErrorReason::MissingField
            }
            ParseError::FieldConversion { .. } => ParseErrorReason::FieldConversion,
            ParseError::InvalidDate { .. } => ParseErrorReason::InvalidDate,
        }
    }

    /// The offending column, when the error is tied to one
    pub fn field(&self) -> Option<Field> {
        match self {
            ParseError::MissingField { .. } => None,
            ParseError::BlankField { field } | ParseError::FieldConversion { field, .. } => {
                Some(*field)
            }
            ParseError::InvalidDate { .. } => Some(Field::Date),
        }
    }
}

/// Errors encoding or decoding the JSON wire representation
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Well-formed JSON that breaks a Transaction invariant
    #[error("invalid transaction: {0}")]
    Invalid(#[from] ParseError),
}
