pub mod app_config;
pub mod catalog_repo;
pub mod database;
pub mod memory;
pub mod order_repo;

pub use catalog_repo::StoreProductCatalog;
pub use database::DbClient;
pub use memory::MemoryStore;
pub use order_repo::StoreOrderRepository;
