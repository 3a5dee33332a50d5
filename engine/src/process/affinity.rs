//! CPU core affinity specifications (`"0,2-3,8"`)

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::ProcessError;

/// A set of logical cores a process should be bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuAffinity {
    cores: Vec<usize>,
}

impl CpuAffinity {
    pub fn new(cores: impl IntoIterator<Item = usize>) -> Result<Self, ProcessError> {
        let cores: BTreeSet<usize> = cores.into_iter().collect();
        if cores.is_empty() {
            return Err(ProcessError::InvalidAffinity {
                spec: String::new(),
                reason: "no cores specified".to_string(),
            });
        }
        Ok(Self { cores: cores.into_iter().collect() })
    }

    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    /// Reject cores the machine does not have
    pub fn validate_against(&self, logical_cores: usize) -> Result<(), ProcessError> {
        match self.cores.iter().find(|core| **core >= logical_cores) {
            Some(core) => Err(ProcessError::InvalidAffinity {
                spec: self.to_string(),
                reason: format!("core {} exceeds the {} logical cores available", core, logical_cores),
            }),
            None => Ok(()),
        }
    }
}

impl FromStr for CpuAffinity {
    type Err = ProcessError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ProcessError::InvalidAffinity {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut cores = BTreeSet::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((start, end)) => {
                    let start: usize = start.trim().parse().map_err(|_| invalid("invalid range start"))?;
                    let end: usize = end.trim().parse().map_err(|_| invalid("invalid range end"))?;
                    if end < start {
                        return Err(invalid("range end precedes start"));
                    }
                    cores.extend(start..=end);
                }
                None => {
                    cores.insert(part.parse().map_err(|_| invalid("invalid core index"))?);
                }
            }
        }

        if cores.is_empty() {
            return Err(invalid("no cores specified"));
        }

        Ok(Self { cores: cores.into_iter().collect() })
    }
}

impl fmt::Display for CpuAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.cores.iter().map(|core| core.to_string()).collect();
        f.write_str(&rendered.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_lists_and_ranges() {
        let affinity: CpuAffinity = "0, 2-4,3,8".parse().unwrap();
        assert_eq!(affinity.cores(), &[0, 2, 3, 4, 8]);
        assert_eq!(affinity.to_string(), "0,2,3,4,8");
    }

    #[test]
    fn test_invalid_specs() {
        assert!("".parse::<CpuAffinity>().is_err());
        assert!("4-2".parse::<CpuAffinity>().is_err());
        assert!("a,b".parse::<CpuAffinity>().is_err());
    }

    #[test]
    fn test_validate_against_core_count() {
        let affinity: CpuAffinity = "0-3".parse().unwrap();
        assert!(affinity.validate_against(4).is_ok());
        assert!(affinity.validate_against(2).is_err());
    }

    proptest! {
        #[test]
        fn range_covers_every_core(start in 0usize..128, width in 0usize..64) {
            let end = start + width;
            let affinity: CpuAffinity = format!("{}-{}", start, end).parse().unwrap();
            prop_assert_eq!(affinity.cores().len(), width + 1);
            prop_assert_eq!(affinity.cores()[0], start);
            prop_assert_eq!(*affinity.cores().last().unwrap(), end);
        }
    }
}
