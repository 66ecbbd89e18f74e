pub mod auth_code;
pub mod client;
pub mod device_authorization;
pub mod property;
pub mod token;
pub mod user;

pub use auth_code::Entity as AuthCode;
pub use client::Entity as Client;
pub use device_authorization::Entity as DeviceAuthorization;
pub use property::Entity as Property;
pub use token::Entity as Token;
pub use user::Entity as User;
