// Core services
pub mod orders;
pub mod payments;

// Catalog and pricing support
pub mod currency;
pub mod products;
