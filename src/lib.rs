#![deny(rust_2018_idioms)]

pub mod cloud;
pub mod machine;
pub mod packer;
pub mod progress;
pub mod run;
pub mod system;
pub mod systems;
pub mod util;

use serde::{Deserialize, Serialize};
use std::fmt;

/// AWS region all experiments run in. The cleanup variables must use the same
/// region, otherwise `terraform destroy` looks at the wrong fleet.
pub const AWS_REGION: &str = "us-east-2";

pub const DEFAULT_INSTANCE_TYPE: &str = "c5.4xlarge";

macro_rules! string_newtype {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_newtype!(
    /// An AWS instance type (e.g. `c5.4xlarge`).
    InstanceType
);
string_newtype!(
    /// A git commit SHA.
    Sha
);
string_newtype!(
    /// A machine image identifier.
    Ami
);
string_newtype!(Region);
string_newtype!(Hostname);

impl InstanceType {
    pub fn default_type() -> Self {
        Self::from(DEFAULT_INSTANCE_TYPE)
    }
}

impl Region {
    pub fn aws() -> Self {
        Self::from(AWS_REGION)
    }
}

/// A size in bytes; used for message sizes and security parameters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bytes(pub u64);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
