pub mod campaign;
pub mod send_record;
pub mod subscriber;

pub use campaign::Entity as Campaign;
pub use send_record::Entity as SendRecord;
pub use subscriber::Entity as Subscriber;
