//! HTTP front end for the Teal trace analyzer

pub mod cli;
pub mod web;
