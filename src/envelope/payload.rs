//! Payload wrappers.
//!
//! Thin typed shells around JSON values. They carry no behavior beyond
//! access to the wrapped object.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

macro_rules! json_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Value);

        impl $name {
            /// Wrap any serializable value.
            pub fn new<T: Serialize>(value: &T) -> Result<Self> {
                Ok(Self(serde_json::to_value(value)?))
            }

            /// Borrow the wrapped JSON.
            pub fn as_value(&self) -> &Value {
                &self.0
            }

            /// Unwrap into the JSON value.
            pub fn into_inner(self) -> Value {
                self.0
            }

            /// Deserialize the wrapped JSON into a concrete type.
            pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
                Ok(serde_json::from_value(self.0.clone())?)
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }

        impl Deref for $name {
            type Target = Value;

            fn deref(&self) -> &Value {
                &self.0
            }
        }
    };
}

json_wrapper!(
    /// A topic message, as published or as received by a subscriber.
    Message
);

json_wrapper!(
    /// Request body for a service call.
    ServiceRequest
);

json_wrapper!(
    /// The `result` of a successful service call.
    ServiceResponse
);

/// A parameter set. Reserved for server-side parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Param {
    /// The parameters.
    pub params: Value,
}

impl Param {
    /// Wrap a parameter object.
    pub fn new(params: Value) -> Self {
        Self { params }
    }
}
