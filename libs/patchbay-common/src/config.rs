// Fixed container-side layout shared by the spec resolver and the worker

pub const IMAGE_PREFIX: &str = "patchbay";
pub const IMAGE_TAG: &str = "v0";

/// Working tree root inside every evaluation container
pub const TESTBED_DIR: &str = "/testbed";

pub const CONTAINER_PATCH_PATH: &str = "/tmp/patch.diff";
pub const CONTAINER_EVAL_SCRIPT_PATH: &str = "/eval.sh";
pub const CONTAINER_REPORT_PATH: &str = "/testbed/report.json";

/// Number of hex digits of the setup-script digest kept in image keys
pub const IMAGE_HASH_LEN: usize = 22;
