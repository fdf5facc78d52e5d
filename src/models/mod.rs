mod account;
mod audit;
mod delivery_log;
mod group;
mod message;
mod provider;

pub use account::*;
pub use audit::*;
pub use delivery_log::*;
pub use group::*;
pub use message::*;
pub use provider::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
