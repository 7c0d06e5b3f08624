//! Site connectivity for the kestrel coordination layer.
//!
//! One seam, two backends: [`store`] defines the connector, connection and
//! serializable local-transaction traits; [`pg`] implements them over
//! tokio-postgres and [`mem`] over in-process tables with row locks and
//! fault hooks. [`resolver`] caches one live connection per site on top of
//! whichever backend is plugged in.

pub mod mem;
pub mod pg;
pub mod resolver;
pub mod store;

pub use mem::{MemConnector, MemSite};
pub use pg::PgConnector;
pub use resolver::ConnectionResolver;
pub use store::{SiteConnection, SiteConnector, SiteTransaction, TxnOf};
