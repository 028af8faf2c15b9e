pub mod chat;
pub mod replica;
pub mod timestamp;
pub mod username;

use std::fmt::Display;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use parley_wire::Reply;

pub(crate) fn decode_params<T, E>(params: Value, invalid: impl FnOnce(String) -> E) -> Result<T, Value>
where
    T: DeserializeOwned,
    E: Serialize + Display,
{
    serde_json::from_value(params)
        .map_err(|err| encode_error(&invalid(format!("bad parameters: {err}"))))
}

pub(crate) fn encode_error<E: Serialize + Display>(error: &E) -> Value {
    serde_json::to_value(error).unwrap_or_else(|_| Value::String(error.to_string()))
}

pub(crate) fn decode_error<E: DeserializeOwned>(error: Value) -> anyhow::Result<E> {
    serde_json::from_value(error).map_err(|err| anyhow::anyhow!("undecodable error value: {err}"))
}

pub(crate) fn unary<T, E>(result: Result<T, E>) -> Reply
where
    T: Serialize,
    E: Serialize + Display,
{
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Reply::Unary(Ok(value)),
            Err(err) => Reply::Unary(Err(Value::String(err.to_string()))),
        },
        Err(error) => Reply::Unary(Err(encode_error(&error))),
    }
}
