//! Fee targets and their current rate estimates

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::WalletError;

/// User-facing shorthand for a confirmation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTargetCode {
    Economy,
    Low,
    Normal,
    High,
    /// A caller-supplied fee rate; never estimated.
    Custom,
}

impl FeeTargetCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeTargetCode::Economy => "economy",
            FeeTargetCode::Low => "low",
            FeeTargetCode::Normal => "normal",
            FeeTargetCode::High => "high",
            FeeTargetCode::Custom => "custom",
        }
    }
}

impl Display for FeeTargetCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeeTargetCode {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "economy" => Ok(FeeTargetCode::Economy),
            "low" => Ok(FeeTargetCode::Low),
            "normal" => Ok(FeeTargetCode::Normal),
            "high" => Ok(FeeTargetCode::High),
            "custom" => Ok(FeeTargetCode::Custom),
            _ => Err(WalletError::invalid_argument(
                "fee_target",
                format!("unknown fee target: {s}"),
            )),
        }
    }
}

/// Target used when a caller does not pick one.
pub const DEFAULT_FEE_TARGET: FeeTargetCode = FeeTargetCode::Normal;

/// A confirmation target and its latest estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeTarget {
    pub code: FeeTargetCode,
    pub blocks: u32,
    /// Satoshis per 1000 virtual bytes.
    pub fee_rate_per_kb: Option<u64>,
}

impl FeeTarget {
    pub fn new(code: FeeTargetCode, blocks: u32) -> Self {
        Self {
            code,
            blocks,
            fee_rate_per_kb: None,
        }
    }
}

/// The fee target table of an account, ascending by target blocks (highest priority first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeTargets {
    targets: Vec<FeeTarget>,
}

impl FeeTargets {
    /// Builds the table from (code, blocks) pairs; order is normalized to ascending blocks.
    pub fn new(blocks: &[(FeeTargetCode, u32)]) -> Self {
        let mut targets: Vec<FeeTarget> = blocks
            .iter()
            .map(|(code, blocks)| FeeTarget::new(*code, *blocks))
            .collect();
        targets.sort_by_key(|target| target.blocks);
        Self { targets }
    }

    pub fn all(&self) -> &[FeeTarget] {
        &self.targets
    }

    pub fn get(&self, code: FeeTargetCode) -> Option<&FeeTarget> {
        self.targets.iter().find(|target| target.code == code)
    }

    /// Stores a new estimate. Returns true if the value changed.
    pub fn set_rate(&mut self, code: FeeTargetCode, fee_rate_per_kb: Option<u64>) -> bool {
        match self.targets.iter_mut().find(|target| target.code == code) {
            Some(target) if target.fee_rate_per_kb != fee_rate_per_kb => {
                target.fee_rate_per_kb = fee_rate_per_kb;
                true
            }
            _ => false,
        }
    }

    /// Targets with a known rate, cheapest first, with equal rates collapsed onto the
    /// highest-priority code, together with the default code to preselect.
    pub fn available(&self) -> (Vec<FeeTarget>, FeeTargetCode) {
        let mut result = Vec::new();
        let mut default_available = false;
        for (i, target) in self.targets.iter().enumerate().rev() {
            let Some(rate) = target.fee_rate_per_kb else {
                continue;
            };
            let shadowed = self.targets[..i]
                .iter()
                .any(|higher| higher.fee_rate_per_kb == Some(rate));
            if shadowed {
                continue;
            }
            if target.code == DEFAULT_FEE_TARGET {
                default_available = true;
            }
            result.push(target.clone());
        }
        let default_code = match result.first() {
            Some(cheapest) if !default_available => cheapest.code,
            _ => DEFAULT_FEE_TARGET,
        };
        (result, default_code)
    }
}
