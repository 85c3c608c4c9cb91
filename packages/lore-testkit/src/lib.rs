//! Disposable Postgres databases for integration tests gated on `LORE_PG_DSN`.

mod error;

pub use error::{Error, Result};

use std::{env, str::FromStr, thread};

use sqlx::{
	ConnectOptions, Connection, Executor,
	postgres::{PgConnectOptions, PgConnection},
};
use tokio::runtime::Builder;
use uuid::Uuid;

const DSN_ENV: &str = "LORE_PG_DSN";
const NAME_PREFIX: &str = "lore_test_";
const MAINTENANCE_DATABASES: [&str; 2] = ["postgres", "template1"];

/// Base DSN for database-backed tests. Unset or blank means those tests skip themselves.
pub fn env_dsn() -> Option<String> {
	env::var(DSN_ENV).ok().filter(|dsn| !dsn.trim().is_empty())
}

/// A uniquely named database on the server `LORE_PG_DSN` points at.
///
/// Call [`TestDatabase::cleanup`] at the end of a test. A database still alive on drop, for
/// example after a failed assertion, is removed from a helper thread.
pub struct TestDatabase {
	name: String,
	dsn: String,
	maintenance: PgConnectOptions,
	dropped: bool,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base = PgConnectOptions::from_str(base_dsn)
			.map_err(|err| Error::InvalidDsn { message: err.to_string() })?;
		let maintenance = maintenance_options(&base).await?;
		let name = format!("{NAME_PREFIX}{}", Uuid::new_v4().simple());
		let mut conn = PgConnection::connect_with(&maintenance).await?;

		conn.execute(format!("CREATE DATABASE {}", quote_ident(&name)).as_str()).await?;
		conn.close().await?;

		let dsn = base.database(&name).to_url_lossy().to_string();

		Ok(Self { name, dsn, maintenance, dropped: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Drops the database. Open pools against it are terminated.
	pub async fn cleanup(mut self) -> Result<()> {
		drop_database(&self.maintenance, &self.name).await?;

		self.dropped = true;

		Ok(())
	}
}
impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.dropped {
			return;
		}

		let name = std::mem::take(&mut self.name);
		let maintenance = self.maintenance.clone();
		// The dropping thread may already be driving a runtime, so block_on runs elsewhere.
		let joined = thread::spawn(move || -> Result<()> {
			let runtime = Builder::new_current_thread().enable_all().build()?;

			runtime.block_on(drop_database(&maintenance, &name))
		})
		.join();

		match joined {
			Ok(Ok(())) => {},
			Ok(Err(err)) => eprintln!("Failed to drop test database on drop: {err}."),
			Err(_) => eprintln!("Test database cleanup thread panicked."),
		}
	}
}

/// Finds a database to issue `CREATE DATABASE` and `DROP DATABASE` from.
async fn maintenance_options(base: &PgConnectOptions) -> Result<PgConnectOptions> {
	let mut last_err = None;

	for database in MAINTENANCE_DATABASES {
		let options = base.clone().database(database);

		match PgConnection::connect_with(&options).await {
			Ok(conn) => {
				conn.close().await?;

				return Ok(options);
			},
			Err(err) => last_err = Some(err),
		}
	}

	Err(Error::NoMaintenanceDatabase {
		message: last_err.map(|err| err.to_string()).unwrap_or_default(),
	})
}

async fn drop_database(maintenance: &PgConnectOptions, name: &str) -> Result<()> {
	let mut conn = PgConnection::connect_with(maintenance).await?;

	conn.execute(format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name)).as_str())
		.await?;
	conn.close().await?;

	Ok(())
}

fn quote_ident(name: &str) -> String {
	format!("\"{}\"", name.replace('"', "\"\""))
}
