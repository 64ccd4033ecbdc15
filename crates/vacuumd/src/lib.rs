pub mod account;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod hub;
pub mod map;
pub mod menu;
pub mod options;
pub mod transport;

pub use account::AccountClient;
pub use account::SessionCredentials;
pub use config::Config;
pub use config::LogLevel;
pub use coordinator::Coordinator;
pub use device::DeviceDescriptor;
pub use device::PropertySnapshot;
pub use hub::Hub;
pub use options::OptionsStore;
pub use transport::Transport;
pub use transport::TransportHandle;
