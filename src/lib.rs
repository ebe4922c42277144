pub mod config;
pub mod controller;
pub mod level;
pub mod mqtt;
pub mod network;
pub mod output;
pub mod persistence;
pub mod restart;
pub mod update;
