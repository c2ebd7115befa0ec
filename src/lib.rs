pub mod api;
pub mod config;
pub mod cqc;
pub mod database_ops;
pub mod logging;
pub mod nhs;
pub mod normalization;
pub mod sync;

pub mod util {
    pub mod env;
}

#[cfg(test)]
mod test_support;
