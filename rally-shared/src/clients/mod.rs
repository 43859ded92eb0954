pub mod data;
pub mod memory;
pub mod postgrest;
pub mod rabbitmq;
pub mod realtime;
pub mod remote;

pub use data::{DataError, DataService, DataServiceExt, Filter, Query, Row};
pub use memory::MemoryDataService;
pub use postgrest::PostgrestClient;
pub use rabbitmq::RabbitMQClient;
pub use realtime::{Binding, ChannelHandle, ChannelSpec, Channels, Subscription};
pub use remote::RemoteDataService;
