// Copyright 2025 Pyro Authors
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

//! The echo server object, for trying out clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use pyro_common::{ObjectMeta, RemoteException};
use pyro_server::{CallArgs, RemoteObject, Reply};
use serde_json::{json, Value};

/// Object id the echo server is registered under.
pub const ECHO_NAME: &str = "test.echoserver";

const SLOW_DELAY: Duration = Duration::from_secs(2);

/// Echoes its arguments back, and a few methods to exercise error, stream
/// and oneway handling.
#[derive(Debug, Default)]
pub struct EchoServer {
    verbose: AtomicBool,
}

impl EchoServer {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose: AtomicBool::new(verbose),
        }
    }

    fn echo(&self, method: &str, args: &CallArgs) -> Result<Value, RemoteException> {
        let message = args.arg(0)?.clone();
        if self.verbose.load(Ordering::Relaxed) {
            tracing::info!(method, message = %message, "Echo");
        }
        Ok(message)
    }
}

impl RemoteObject for EchoServer {
    fn metadata(&self) -> ObjectMeta {
        ObjectMeta::new()
            .method("echo")
            .method("error")
            .method("generator")
            .method("slow")
            .oneway_method("oneway_echo")
            .attribute("verbose")
    }

    fn call(&self, method: &str, args: CallArgs) -> Result<Reply, RemoteException> {
        match method {
            "echo" | "oneway_echo" => self.echo(method, &args).map(Reply::from),
            "error" => Err(RemoteException::value_error(
                "expected error from echoserver error() method",
            )),
            "generator" => Ok(Reply::stream(["one", "two", "three"].map(|s| json!(s)))),
            "slow" => {
                thread::sleep(SLOW_DELAY);
                Ok(json!("slow and steady").into())
            }
            _ => Err(RemoteException::attribute_error(method)),
        }
    }

    fn get_attribute(&self, name: &str) -> Result<Value, RemoteException> {
        match name {
            "verbose" => Ok(json!(self.verbose.load(Ordering::Relaxed))),
            _ => Err(RemoteException::attribute_error(name)),
        }
    }

    fn set_attribute(&self, name: &str, value: Value) -> Result<(), RemoteException> {
        match name {
            "verbose" => {
                let verbose = value
                    .as_bool()
                    .ok_or_else(|| RemoteException::type_error("verbose must be a boolean"))?;
                self.verbose.store(verbose, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(RemoteException::attribute_error(name)),
        }
    }
}
