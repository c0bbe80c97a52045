#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

pub mod catalog;
pub use catalog::{Catalog, PortRecord};

pub mod config;
pub use config::{Config, ConfigBuilder};

pub mod port;
pub use port::{DepKind, Origin, Port, PortState};

pub mod resolver;
pub use resolver::Graph;

pub mod scheduler;
pub use scheduler::{Assignment, Counts, Outcome, Scheduler};

pub mod sandbox;

pub mod stores;
pub use stores::{LogStore, PackageStore, Stores};

pub mod worker;
pub use worker::{BuildRunner, BuildStatus, ExitReason, ProcessRunner, Worker, WorkerState};

pub mod supervisor;
pub use supervisor::Supervisor;

pub mod report;
pub use report::CampaignSummary;

pub mod utils;
