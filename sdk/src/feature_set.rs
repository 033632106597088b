//! The set of runtime features that change loader behavior.
//!
//! Every feature the loader branches on is a named boolean. A `FeatureSet` is
//! built once per transaction batch and handed to the invoke context; nothing
//! reads feature state from a global.

use serde_derive::{Deserialize, Serialize};

/// `FeatureSet` holds the set of currently active/inactive runtime features
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureSet {
    /// Map account data directly into the VM instead of copying it
    pub bpf_account_data_direct_mapping: bool,
    /// Stop rejecting instructions based on the executable flag of accounts
    pub remove_accounts_executable_flag_checks: bool,
    /// Enable the `SetAuthorityChecked` upgradeable loader instruction
    pub enable_bpf_loader_set_authority_checked_ix: bool,
    /// Enable `ExtendProgramChecked` and retire `ExtendProgram`
    pub enable_extend_program_checked: bool,
    /// Enable loader v4 and the `Migrate` instruction targeting it
    pub enable_loader_v4: bool,
    /// Consume all remaining compute units when a program faults
    pub deplete_cu_meter_on_vm_failure: bool,
    /// Serialize `u64::MAX` instead of the real rent epoch into VM input
    pub mask_out_rent_epoch_in_vm_serialization: bool,
    /// Programs become invocable one slot after they were (re)deployed
    pub delay_visibility_of_program_deployment: bool,
    pub disable_sbpf_v0_execution: bool,
    pub reenable_sbpf_v0_execution: bool,
    pub enable_sbpf_v1_deployment_and_execution: bool,
    pub enable_sbpf_v2_deployment_and_execution: bool,
    pub enable_sbpf_v3_deployment_and_execution: bool,
}

impl FeatureSet {
    /// All features enabled, useful for testing
    pub fn all_enabled() -> Self {
        Self {
            bpf_account_data_direct_mapping: true,
            remove_accounts_executable_flag_checks: true,
            enable_bpf_loader_set_authority_checked_ix: true,
            enable_extend_program_checked: true,
            enable_loader_v4: true,
            deplete_cu_meter_on_vm_failure: true,
            mask_out_rent_epoch_in_vm_serialization: true,
            delay_visibility_of_program_deployment: true,
            disable_sbpf_v0_execution: true,
            reenable_sbpf_v0_execution: true,
            enable_sbpf_v1_deployment_and_execution: true,
            enable_sbpf_v2_deployment_and_execution: true,
            enable_sbpf_v3_deployment_and_execution: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_inactive() {
        let feature_set = FeatureSet::default();
        assert!(!feature_set.enable_loader_v4);
        assert!(!feature_set.bpf_account_data_direct_mapping);
        assert_ne!(feature_set, FeatureSet::all_enabled());
    }

    #[test]
    fn test_all_enabled() {
        let feature_set = FeatureSet::all_enabled();
        assert!(feature_set.enable_loader_v4);
        assert!(feature_set.remove_accounts_executable_flag_checks);
        assert!(feature_set.enable_sbpf_v3_deployment_and_execution);
    }
}
