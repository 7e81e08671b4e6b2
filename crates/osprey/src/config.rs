/// Backend configuration. Optimization toggles default to off; callers opt in
/// per run.
#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Enable the primitive analyzer.
    pub optimize_primops: bool,
    /// Hoist heap allocations to function prologues.
    pub optimize_hoist_allocations: bool,
    /// Enable the rename/remove-alias/combine peephole passes.
    pub optimize_alias: bool,
    /// Enable experimental rewrites (alias hoisting) and elide asserts.
    pub optimize_experimental: bool,
    /// Limit generated function and letbind helpers to internal linkage.
    pub static_linkage: bool,
    /// Omit the `main` wrapper; only `model_main` is emitted.
    pub no_main: bool,
    /// Omit runtime-helper includes and the init/fini scaffold.
    pub no_rts: bool,
    /// Prepended to every generated function identifier.
    pub prefix: String,
    /// Extra textual parameter list threaded through every non-extern
    /// function signature.
    pub extra_params: Option<String>,
    /// Extra textual argument list threaded through every call site.
    pub extra_arguments: Option<String>,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        CodegenConfig {
            optimize_primops: false,
            optimize_hoist_allocations: false,
            optimize_alias: false,
            optimize_experimental: false,
            static_linkage: false,
            no_main: false,
            no_rts: false,
            prefix: String::new(),
            extra_params: None,
            extra_arguments: None,
        }
    }
}

impl CodegenConfig {
    /// Everything on, as a release build of a model would use.
    pub fn optimized() -> Self {
        CodegenConfig {
            optimize_primops: true,
            optimize_hoist_allocations: true,
            optimize_alias: true,
            ..CodegenConfig::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn without_main(mut self) -> Self {
        self.no_main = true;
        self
    }

    pub fn without_rts(mut self) -> Self {
        self.no_rts = true;
        self
    }
}
