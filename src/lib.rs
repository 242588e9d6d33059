pub mod config;
pub mod error;
pub mod feeds;
pub mod market_data;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod position_book;
pub mod signals;
pub mod simulator;
pub mod sweep;
pub mod trading_rules;
