pub mod admin;
pub mod auth;
pub mod checkout;
pub mod discounts;
pub mod orders;
pub mod payments;
pub mod products;
pub mod turns;
pub mod users;
pub mod webhooks;
