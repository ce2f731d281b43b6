//! Policy defaults (`berth.toml`).
//!
//! One immutable [`PolicyDefaults`] value is handed to every allocation run.
//! Every option has a default, so an empty file is a valid policy; keys the
//! allocator does not know are ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyDefaults {
    // ── Hard filter switches ──────────────────────────────────────
    pub filter_headnode: bool,
    pub filter_reserved: bool,
    pub filter_large_servers: bool,
    /// Share of servers (by most unreserved RAM) held back for large allocations.
    pub large_server_ratio: f64,
    pub filter_overprovision_ratios: bool,
    pub strict_overprovision_cpu: bool,
    pub strict_overprovision_ram: bool,
    pub strict_overprovision_disk: bool,
    pub filter_cpu_cap: bool,
    pub filter_vm_count: bool,
    pub vm_count_limit: usize,
    pub filter_strict_locality: bool,
    pub filter_owner_many_zones: bool,
    /// Share of servers with the fewest owner VMs kept by the owner-zone filter.
    pub owner_zone_spread_ratio: f64,
    /// Servers carrying traits only accept workloads that ask for traits.
    pub reserve_traited_servers: bool,

    // ── Assumed server values ─────────────────────────────────────
    pub overprovision_ratio_cpu: f64,
    pub overprovision_ratio_ram: f64,
    pub overprovision_ratio_disk: f64,
    pub reservation_ratio: f64,

    // ── Scorer weights ────────────────────────────────────────────
    pub weight_unreserved_ram: f64,
    pub weight_unreserved_disk: f64,
    pub weight_num_owner_zones: f64,
    pub weight_current_platform: f64,
    pub weight_next_reboot: f64,
    /// Magnitude of the random tie-breaking jitter.
    pub weight_uniform_random: f64,
    /// Reboots further away than this many hours are not imminent.
    pub reboot_horizon_hours: f64,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            filter_headnode: true,
            filter_reserved: true,
            filter_large_servers: true,
            large_server_ratio: 0.15,
            filter_overprovision_ratios: true,
            strict_overprovision_cpu: true,
            strict_overprovision_ram: true,
            strict_overprovision_disk: true,
            filter_cpu_cap: true,
            filter_vm_count: true,
            vm_count_limit: 224,
            filter_strict_locality: true,
            filter_owner_many_zones: false,
            owner_zone_spread_ratio: 0.25,
            reserve_traited_servers: false,

            overprovision_ratio_cpu: 4.0,
            overprovision_ratio_ram: 1.0,
            overprovision_ratio_disk: 1.0,
            reservation_ratio: 0.15,

            weight_unreserved_ram: 2.0,
            weight_unreserved_disk: 1.0,
            weight_num_owner_zones: 0.0,
            weight_current_platform: 1.0,
            weight_next_reboot: 0.5,
            weight_uniform_random: 0.5,
            reboot_horizon_hours: 168.0,
        }
    }
}

impl PolicyDefaults {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let defaults: PolicyDefaults = toml::from_str(content)?;
        defaults.validate()?;
        Ok(defaults)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject recognized options whose values make no sense.
    pub fn validate(&self) -> ConfigResult<()> {
        let unit_ratios = [
            ("large_server_ratio", self.large_server_ratio),
            ("owner_zone_spread_ratio", self.owner_zone_spread_ratio),
            ("reservation_ratio", self.reservation_ratio),
        ];
        for (name, value) in unit_ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within 0..=1, got {value}")));
            }
        }

        let overprovision = [
            ("overprovision_ratio_cpu", self.overprovision_ratio_cpu),
            ("overprovision_ratio_ram", self.overprovision_ratio_ram),
            ("overprovision_ratio_disk", self.overprovision_ratio_disk),
        ];
        for (name, value) in overprovision {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }

        let weights = [
            ("weight_unreserved_ram", self.weight_unreserved_ram),
            ("weight_unreserved_disk", self.weight_unreserved_disk),
            ("weight_num_owner_zones", self.weight_num_owner_zones),
            ("weight_current_platform", self.weight_current_platform),
            ("weight_next_reboot", self.weight_next_reboot),
            ("weight_uniform_random", self.weight_uniform_random),
        ];
        for (name, value) in weights {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be finite")));
            }
        }

        if self.weight_uniform_random < 0.0 {
            return Err(ConfigError::Invalid("weight_uniform_random must not be negative".into()));
        }
        if !(self.reboot_horizon_hours > 0.0) {
            return Err(ConfigError::Invalid("reboot_horizon_hours must be positive".into()));
        }
        Ok(())
    }
}
