pub mod client;
pub mod consumer;
pub mod dispatcher;
pub mod fcm;
pub mod provider;

pub use client::{BatchObserver, DeliveryClient, DeliveryError, DeliverySettings, Outcomes};
pub use consumer::run;
pub use dispatcher::FanoutDispatcher;
pub use fcm::FcmProvider;
pub use provider::{ProviderError, PushProvider};
