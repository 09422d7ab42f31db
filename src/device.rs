use std::fmt;
use std::str::FromStr;

use candle_core::Device;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("CUDA device {ordinal} is unavailable: {source}")]
    Unavailable {
        ordinal: usize,
        #[source]
        source: candle_core::Error,
    },
    #[error("unknown device selector '{0}' (expected cpu, auto, cuda or cuda:N)")]
    UnknownSelector(String),
    #[error("tensor allocation failed on {device}: {source}")]
    Allocation {
        device: String,
        #[source]
        source: candle_core::Error,
    },
}

/// Requested compute placement. The preference resolves exactly once to
/// a concrete [`Device`], and that device is then used for the weights,
/// the dummy input, and any trace execution alike.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    CudaIfAvailable,
    Cuda(usize),
}

impl DevicePreference {
    pub fn resolve(&self) -> Result<Device, DeviceError> {
        match self {
            DevicePreference::Cpu => Ok(Device::Cpu),
            DevicePreference::CudaIfAvailable => match Device::cuda_if_available(0) {
                Ok(device) => {
                    if !device.is_cuda() {
                        log::info!("no CUDA device present, using CPU");
                    }
                    Ok(device)
                }
                Err(e) => {
                    log::warn!("CUDA initialization failed ({e}), using CPU");
                    Ok(Device::Cpu)
                }
            },
            DevicePreference::Cuda(ordinal) => {
                Device::new_cuda(*ordinal).map_err(|source| DeviceError::Unavailable {
                    ordinal: *ordinal,
                    source,
                })
            }
        }
    }
}

impl FromStr for DevicePreference {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(DevicePreference::Cpu),
            "auto" => Ok(DevicePreference::CudaIfAvailable),
            "cuda" => Ok(DevicePreference::Cuda(0)),
            other => {
                if let Some(ordinal) = other.strip_prefix("cuda:") {
                    ordinal
                        .parse()
                        .map(DevicePreference::Cuda)
                        .map_err(|_| DeviceError::UnknownSelector(other.to_string()))
                } else {
                    Err(DeviceError::UnknownSelector(other.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Cpu => write!(f, "cpu"),
            DevicePreference::CudaIfAvailable => write!(f, "auto"),
            DevicePreference::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_parse() {
        assert_eq!("cpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!(
            "auto".parse::<DevicePreference>().unwrap(),
            DevicePreference::CudaIfAvailable
        );
        assert_eq!(
            "cuda".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda(0)
        );
        assert_eq!(
            "cuda:2".parse::<DevicePreference>().unwrap(),
            DevicePreference::Cuda(2)
        );
        assert!(matches!(
            "gpu".parse::<DevicePreference>(),
            Err(DeviceError::UnknownSelector(_))
        ));
        assert!(matches!(
            "cuda:x".parse::<DevicePreference>(),
            Err(DeviceError::UnknownSelector(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        for selector in ["cpu", "auto", "cuda:3"] {
            let parsed = selector.parse::<DevicePreference>().unwrap();
            assert_eq!(parsed.to_string(), selector);
        }
    }

    #[test]
    fn cpu_preference_resolves() {
        let device = DevicePreference::Cpu.resolve().unwrap();
        assert!(!device.is_cuda());
    }
}
