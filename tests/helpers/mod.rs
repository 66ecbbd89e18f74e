#![allow(dead_code)]

pub mod builders;
pub mod db;

pub use builders::{ClientBuilder, UserBuilder};
pub use db::{test_app, TestApp, TestDb};
