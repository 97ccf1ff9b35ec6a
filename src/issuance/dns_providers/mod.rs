mod azure;
mod memory;

pub use azure::AzureDnsClient;
pub use memory::MemoryDnsZoneClient;
