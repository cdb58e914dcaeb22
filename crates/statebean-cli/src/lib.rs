// Copyright 2025 statebean Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # statebean CLI
//!
//! Command-line interface for statebean containers.
//!
//! - `statebean serve`: deploy containers from a config file (or the demo
//!   beans) on one or more in-process nodes
//! - `statebean call`: invoke one method over the wire (raw JSON output)
//! - `statebean stats` / `statebean info`: read a server's built-in endpoints
//!
//! The library half holds what `serve` deploys ([`demo`]) and how nodes are
//! wired together ([`deploy`]).

pub mod demo;
pub mod deploy;

pub use deploy::{LocalCluster, LocalNode};
