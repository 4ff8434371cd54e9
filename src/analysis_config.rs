//! A global store of flags that can impact analysis.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different sessions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
#[derive(Debug)]
pub struct AnalysisConfig {
    /// Run the semantic tagger on fallthrough instructions. Without this, every fallthrough
    /// instruction is left as `null`.
    pub enable_semantic_tagging: bool,
    /// Produce ESIL for control transfers too, not just fallthrough instructions.
    pub lower_control_transfers: bool,
    /// Panic, rather than degrading the record to `unk`, when the decoder breaks its contract.
    /// Useful when debugging a decoder.
    pub panic_on_decoder_inconsistency: bool,
    /// Whether to print each micro-op as it is lowered (useful when debugging)
    pub debug_print_micro_ops: bool,
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        // Never initialized (e.g., in tests) means defaults
        let init = unsafe { INTERNAL_CONFIG_INITIALIZER.take() };
        init.flatten().unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableSemanticTagging,
    DisableControlTransferLowering,
    PanicOnDecoderInconsistency,
    EnableDebugPrintMicroOps,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            enable_semantic_tagging: true,
            lower_control_transfers: true,
            panic_on_decoder_inconsistency: false,
            debug_print_micro_ops: false,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableSemanticTagging => {
                    r.enable_semantic_tagging = false;
                }
                DisableControlTransferLowering => {
                    r.lower_control_transfers = false;
                }
                PanicOnDecoderInconsistency => {
                    r.panic_on_decoder_inconsistency = true;
                }
                EnableDebugPrintMicroOps => {
                    r.debug_print_micro_ops = true;
                }
            }
        }
        r
    }
}
