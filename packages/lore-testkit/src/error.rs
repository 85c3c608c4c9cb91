pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("LORE_PG_DSN is not a valid Postgres DSN: {message}")]
	InvalidDsn { message: String },
	#[error("No maintenance database is reachable: {message}")]
	NoMaintenanceDatabase { message: String },
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
}
