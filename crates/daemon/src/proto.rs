// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Anvil Contributors

//! Wire messages exchanged between the wrapper, emitters, and absorbers.
//!
//! Messages are hand-derived prost structs; the field numbers are the wire
//! contract and must not be reassigned. Every payload on a connection is a
//! [`Universal`] carrying exactly one inner message.

/// A named compiler plugin; the path is filled in by the receiving daemon
/// when absent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Plugin {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub path: Option<String>,
}

/// Compiler identity. The version string selects a configured toolchain;
/// the path is resolved on the executing side.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Compiler {
    #[prost(string, optional, tag = "1")]
    pub path: Option<String>,
    #[prost(string, tag = "2")]
    pub version: String,
    #[prost(message, repeated, tag = "3")]
    pub plugins: Vec<Plugin>,
}

/// A compiler command line split into caching categories.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Flags {
    #[prost(message, optional, tag = "1")]
    pub compiler: Option<Compiler>,
    /// Cacheable flags; always rendered first ("-cc1" lives here).
    #[prost(string, repeated, tag = "2")]
    pub other: Vec<String>,
    /// The action flag, e.g. "-emit-obj", "-E", "-S".
    #[prost(string, tag = "3")]
    pub action: String,
    #[prost(string, optional, tag = "4")]
    pub input: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub output: Option<String>,
    #[prost(string, optional, tag = "6")]
    pub deps_file: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub language: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub sanitize_blacklist: Option<String>,
    /// Cacheable, but only meaningful for compile actions.
    #[prost(string, repeated, tag = "9")]
    pub cc_only: Vec<String>,
    /// Per-invocation flags that must be passed but never keyed on.
    #[prost(string, repeated, tag = "10")]
    pub non_cached: Vec<String>,
    /// Tolerated by the simple tier, excluded from the direct-tier key.
    #[prost(string, repeated, tag = "11")]
    pub non_direct: Vec<String>,
}

/// Client request: run this compilation on behalf of the wrapper.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocalExecute {
    /// Absolute working directory of the client.
    #[prost(string, tag = "1")]
    pub current_dir: String,
    /// When present, subprocesses and created files run as this uid.
    #[prost(uint32, optional, tag = "2")]
    pub user_id: Option<u32>,
    #[prost(message, optional, tag = "3")]
    pub flags: Option<Flags>,
}

/// Peer request: compile this preprocessed source.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteExecute {
    #[prost(message, optional, tag = "1")]
    pub flags: Option<Flags>,
    #[prost(bytes = "vec", tag = "2")]
    pub source: Vec<u8>,
}

/// Peer reply: the produced object, optionally with the deps it echoes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoteResult {
    #[prost(bytes = "vec", tag = "1")]
    pub obj: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub deps: Option<Vec<u8>>,
}

/// Outcome taxonomy for every stage of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    /// Framing or parse error; the connection is closed.
    BadMessage = 1,
    /// Socket-level error; the connection is closed.
    Network = 2,
    /// Operation on a closed connection, or a request that cannot make
    /// progress on this connection.
    Inconsequent = 3,
    /// Requested compiler version or plugin is not configured here.
    NoVersion = 4,
    /// Subprocess failed; the description carries its stderr.
    Execution = 5,
    /// All remotes saturated and local execution is disabled.
    Overload = 6,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub description: String,
}

impl Status {
    pub fn new(code: StatusCode, description: impl Into<String>) -> Self {
        Status {
            code: code as i32,
            description: description.into(),
        }
    }

    pub fn ok(description: impl Into<String>) -> Self {
        Status::new(StatusCode::Ok, description)
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::try_from(self.code).unwrap_or(StatusCode::Network)
    }
}

/// Envelope for every framed payload; exactly one field is set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Universal {
    #[prost(message, optional, tag = "1")]
    pub local_execute: Option<LocalExecute>,
    #[prost(message, optional, tag = "2")]
    pub remote_execute: Option<RemoteExecute>,
    #[prost(message, optional, tag = "3")]
    pub remote_result: Option<RemoteResult>,
    #[prost(message, optional, tag = "4")]
    pub status: Option<Status>,
}

impl Universal {
    pub fn from_status(status: Status) -> Self {
        Universal {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn from_local_execute(message: LocalExecute) -> Self {
        Universal {
            local_execute: Some(message),
            ..Default::default()
        }
    }

    pub fn from_remote_execute(message: RemoteExecute) -> Self {
        Universal {
            remote_execute: Some(message),
            ..Default::default()
        }
    }

    /// A reply carrying both a status and a result.
    pub fn from_result(status: Status, result: RemoteResult) -> Self {
        Universal {
            remote_result: Some(result),
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[path = "proto_tests.rs"]
mod tests;
