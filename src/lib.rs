pub mod config;
pub mod crypto;
pub mod db;
pub mod panel;
pub mod provisioning;
pub mod web;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
