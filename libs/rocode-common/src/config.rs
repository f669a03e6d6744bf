use std::path::PathBuf;

/// Judge configuration, resolved once at startup from the environment.
///
/// Per-test resource limits are NOT configured here - they arrive on each
/// test spec from the problem definition and are honored exactly.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub redis_url: String,
    /// Fixed worker count. This is the sole admission-control mechanism
    /// bounding concurrent sandboxed processes on the host.
    pub worker_count: usize,
    /// Scratch directory for generated source files.
    pub sandbox_dir: PathBuf,
    /// Explicit interpreter path. When unset the judge probes the usual
    /// install locations and PATH.
    pub luau_binary: Option<PathBuf>,
    /// Prefer the container backend over a bare interpreter process.
    pub use_docker: bool,
    pub sandbox_image: String,
}

pub const DEFAULT_WORKER_COUNT: usize = 4;

impl JudgeConfig {
    pub fn from_env() -> Self {
        let worker_count = std::env::var("ROCODE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_WORKER_COUNT);

        JudgeConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            worker_count,
            sandbox_dir: std::env::var("ROCODE_SANDBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/rocode-sandbox")),
            luau_binary: std::env::var("ROCODE_LUAU_BINARY").ok().map(PathBuf::from),
            use_docker: std::env::var("ROCODE_USE_DOCKER")
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
            sandbox_image: std::env::var("ROCODE_SANDBOX_IMAGE")
                .unwrap_or_else(|_| "rocode/luau-sandbox:latest".to_string()),
        }
    }
}
