pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("Search failed in {space} space: {message}")]
	Search { space: &'static str, message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Internal error: {message}")]
	Internal { message: String },
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}

impl From<lore_storage::Error> for Error {
	fn from(err: lore_storage::Error) -> Self {
		match err {
			lore_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			lore_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			lore_storage::Error::NotFound(message) => Self::NotFound { message },
		}
	}
}

impl From<lore_providers::Error> for Error {
	fn from(err: lore_providers::Error) -> Self {
		Self::Provider { message: err.to_string() }
	}
}

impl From<lore_config::Error> for Error {
	fn from(err: lore_config::Error) -> Self {
		Self::InvalidRequest { message: err.to_string() }
	}
}

impl From<lore_domain::UnknownVariant> for Error {
	fn from(err: lore_domain::UnknownVariant) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
