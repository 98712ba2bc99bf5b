//! The daemon's own remote interface, registered as `Pyro.Daemon`.

use pyro_common::{ObjectMeta, RemoteException};
use serde_json::{json, Value};

use super::Daemon;
use crate::object::{CallArgs, Reply};

pub(crate) fn metadata() -> ObjectMeta {
    ObjectMeta::new()
        .method("ping")
        .method("registered")
        .method("get_metadata")
        .method("get_next_stream_item")
        .oneway_method("close_stream")
        .method("info")
}

impl Daemon {
    pub(crate) fn call_builtin(
        &self,
        client_id: u64,
        method: &str,
        args: &CallArgs,
    ) -> Result<Reply, RemoteException> {
        let value = match method {
            "ping" => Value::Null,
            "registered" => json!(self.registered()),
            "get_metadata" => {
                let object_id = args.str_arg(0)?;
                let meta = self.metadata(object_id).map_err(|e| e.to_remote_exception())?;
                serde_json::to_value(meta).map_err(|e| RemoteException::new("SerializeError", e.to_string()))?
            }
            "get_next_stream_item" => self.streams().next(args.str_arg(0)?, client_id)?,
            "close_stream" => {
                self.streams().close(args.str_arg(0)?);
                Value::Null
            }
            "info" => json!(self.info()),
            other => {
                return Err(RemoteException::attribute_error(format!(
                    "daemon object has no method '{}'",
                    other
                )))
            }
        };
        Ok(Reply::Value(value))
    }
}
