#[macro_use]
extern crate diesel;

pub mod admin;
pub mod connection;
pub mod dml;
pub mod error;
pub mod meta;
pub mod system_tables;

pub use self::admin::{AdminDatabase, PgAdmin};
pub use self::connection::{PgExecutor, TenantConnection, TenantConnector};
pub use self::dml::{DmlHandler, DmlQuery};
pub use self::error::StoreError;
pub use self::meta::{IndexerMeta, IndexerMetaFactory, IndexerMetaStore};

use diesel::{
    r2d2::{self, ConnectionManager},
    Connection, PgConnection,
};

pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

pub fn create_r2d2_connection_pool<T: 'static + Connection>(
    db_url: &str,
    pool_size: u32,
) -> Result<r2d2::Pool<ConnectionManager<T>>, StoreError> {
    let manager = ConnectionManager::<T>::new(db_url);
    Ok(r2d2::Pool::builder().max_size(pool_size).build(manager)?)
}
