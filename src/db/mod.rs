mod connection;
mod handle;
mod postgres;

pub use connection::*;
pub use handle::*;
pub use postgres::PgConnection;
