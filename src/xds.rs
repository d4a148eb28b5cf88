// Copyright Istio Authors
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

use prost::Message;
use prost_types::Any;

pub use types::*;

mod types;
pub mod wire;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unexpected type url: want {want}, got {got}")]
    TypeMismatch { want: String, got: String },
    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("field {0} is truncated")]
    Truncated(u32),
    #[error("field {0} uses the unsupported group encoding")]
    Group(u32),
}

/// Packs a message into an `Any` under the given type URL.
pub fn to_any<T: Message>(type_url: &str, msg: &T) -> Result<Any, Error> {
    let mut value = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut value)?;
    Ok(Any {
        type_url: type_url.to_string(),
        value,
    })
}

/// Unpacks an `Any`, checking that it carries the expected type URL.
pub fn from_any<T: Message + Default>(type_url: &str, any: &Any) -> Result<T, Error> {
    if any.type_url != type_url {
        return Err(Error::TypeMismatch {
            want: type_url.to_string(),
            got: any.type_url.clone(),
        });
    }
    Ok(T::decode(&any.value[..])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::envoy::config::core::v3::TypedExtensionConfig;

    #[test]
    fn any_type_checked() {
        let ec = TypedExtensionConfig {
            name: "ext".to_string(),
            typed_config: None,
        };
        let any = to_any(&EXTENSION_CONFIG_TYPE, &ec).unwrap();
        let back: TypedExtensionConfig = from_any(&EXTENSION_CONFIG_TYPE, &any).unwrap();
        assert_eq!(back, ec);

        let err = from_any::<TypedExtensionConfig>(&WASM_HTTP_FILTER_TYPE, &any).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let any = Any {
            type_url: EXTENSION_CONFIG_TYPE.to_string(),
            value: vec![0xff, 0xff, 0xff],
        };
        let err = from_any::<TypedExtensionConfig>(&EXTENSION_CONFIG_TYPE, &any).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
