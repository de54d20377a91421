pub mod channels;
pub mod model;
pub mod normalizer;

pub use channels::{
    ChannelSchema, ChannelTable, AIR_QUALITY, ALCOHOL, CO, HUMIDITY, TEMPERATURE,
};
pub use model::SensorReading;
pub use normalizer::{Normalizer, RejectReason};
