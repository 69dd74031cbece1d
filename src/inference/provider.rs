use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inference provider preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    /// Try every provider in [`AUTO_ORDER`]
    #[default]
    Auto,
    Cpu,
    DirectMl,
    /// Qualcomm NPU
    Qnn,
    Cuda,
    Rocm,
    CoreMl,
}

/// Order tried when the preference is [`Provider::Auto`]
pub const AUTO_ORDER: [Provider; 6] = [
    Provider::Qnn,
    Provider::DirectMl,
    Provider::Cuda,
    Provider::Rocm,
    Provider::CoreMl,
    Provider::Cpu,
];

impl Provider {
    /// Every concrete provider, in auto order
    pub fn all() -> &'static [Provider] {
        &AUTO_ORDER
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Auto => "auto",
            Provider::Cpu => "cpu",
            Provider::DirectMl => "dml",
            Provider::Qnn => "qnn",
            Provider::Cuda => "cuda",
            Provider::Rocm => "rocm",
            Provider::CoreMl => "coreml",
        }
    }

    /// Tag used in provider-specific model filenames
    pub fn tag(&self) -> &'static str {
        self.as_str()
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Provider::Auto | Provider::Cpu)
    }

    /// Providers to try, in order.
    ///
    /// An explicit preference without fallback yields only that provider.
    /// `Auto` yields [`AUTO_ORDER`]. An explicit preference with fallback
    /// puts the preference first and then the rest of the auto order.
    pub fn fallback_order(preferred: Provider, allow_fallback: bool) -> Vec<Provider> {
        if preferred == Provider::Auto {
            return AUTO_ORDER.to_vec();
        }
        if !allow_fallback {
            return vec![preferred];
        }

        let mut order = Vec::with_capacity(AUTO_ORDER.len());
        order.push(preferred);
        for provider in AUTO_ORDER {
            if !order.contains(&provider) {
                order.push(provider);
            }
        }
        order
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = std::convert::Infallible;

    /// Unknown names map to `Auto`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Provider::Cpu,
            "dml" | "directml" => Provider::DirectMl,
            "qnn" | "npu" => Provider::Qnn,
            "cuda" => Provider::Cuda,
            "rocm" => Provider::Rocm,
            "coreml" => Provider::CoreMl,
            _ => Provider::Auto,
        })
    }
}

impl From<String> for Provider {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl From<Provider> for String {
    fn from(provider: Provider) -> Self {
        provider.as_str().to_string()
    }
}
