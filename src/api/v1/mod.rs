pub mod auth;
pub mod cashout;
pub mod parcel;
pub mod payment;
pub mod rider;
pub mod user;
