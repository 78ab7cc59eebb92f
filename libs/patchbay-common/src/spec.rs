/// Spec Resolver - Instance → BuildSpec
///
/// Pure derivation of everything the worker needs to build, name and drive
/// the evaluation container for one dataset record. No I/O.
///
/// Naming rules:
/// - image key:      `patchbay.repo.<slug>.<digest>:v0`
/// - container name: `patchbay.eval.<slug>`
///
/// The container name depends on the repository only, so there is never
/// more than one evaluation container per repository.

use crate::config::{IMAGE_HASH_LEN, IMAGE_PREFIX, IMAGE_TAG, TESTBED_DIR};
use crate::types::Instance;
use sha2::{Digest, Sha256};

/// Placeholders substituted by [`BuildSpec::render_eval_script`]
pub const TEST_CMD_PLACEHOLDER: &str = "{test_cmd}";
pub const TESTS_PLACEHOLDER: &str = "{tests}";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecError {
    #[error("instance is missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub repo: String,
    pub repo_name: String,
    pub base_commit: String,
    pub image_key: String,
    pub container_name: String,
    pub setup_script: String,
    /// Template containing `{test_cmd}` and `{tests}`
    pub eval_script: String,
}

impl BuildSpec {
    pub fn render_eval_script(&self, test_cmd: &str, tests: &str) -> String {
        render_eval_template(&self.eval_script, test_cmd, tests)
    }

    /// Directory name used for this image's build logs (`:` is not path-safe everywhere)
    pub fn build_dir_name(&self) -> String {
        self.image_key.replace(':', "__")
    }
}

/// Fill `{test_cmd}` and `{tests}` in one left-to-right pass.
///
/// Substituted values are copied verbatim and never rescanned, so a test
/// command that itself contains `{tests}` survives unchanged.
pub fn render_eval_template(template: &str, test_cmd: &str, tests: &str) -> String {
    let mut out = String::with_capacity(template.len() + test_cmd.len() + tests.len());
    let mut rest = template;

    while let Some(pos) = rest.find('{') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix(TEST_CMD_PLACEHOLDER) {
            out.push_str(test_cmd);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(TESTS_PLACEHOLDER) {
            out.push_str(tests);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }

    out.push_str(rest);
    out
}

/// Derive the build/run specification for one instance
pub fn make_spec(instance: &Instance) -> Result<BuildSpec, SpecError> {
    let repo = required(&instance.repo, "repo")?;
    let base_commit = required(&instance.base_commit, "base_commit")?;
    required(&instance.test.test_cmd, "test.test_cmd")?;

    let repo_name = repo.rsplit('/').next().unwrap_or(repo).trim().to_string();
    if repo_name.is_empty() {
        return Err(SpecError::MissingField("repo"));
    }
    let slug = slugify(&repo_name);

    let setup_script = setup_script(repo, base_commit);
    let digest = hex_digest(setup_script.as_bytes());

    Ok(BuildSpec {
        repo: repo.to_string(),
        repo_name,
        base_commit: base_commit.to_string(),
        image_key: format!(
            "{}.repo.{}.{}:{}",
            IMAGE_PREFIX,
            slug,
            &digest[..IMAGE_HASH_LEN],
            IMAGE_TAG
        ),
        container_name: format!("{}.eval.{}", IMAGE_PREFIX, slug),
        setup_script,
        eval_script: default_eval_script(base_commit),
    })
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, SpecError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(SpecError::MissingField(field))
    } else {
        Ok(trimmed)
    }
}

/// Docker image and container names only accept `[a-z0-9_.-]` here
fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '-',
        })
        .collect()
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn setup_script(repo: &str, base_commit: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -euxo pipefail\n\
         git clone -o origin https://github.com/{repo} {dir}\n\
         cd {dir}\n\
         git reset --hard {commit}\n\
         git remote remove origin\n",
        repo = repo,
        dir = TESTBED_DIR,
        commit = base_commit,
    )
}

fn default_eval_script(base_commit: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -uxo pipefail\n\
         cd {dir}\n\
         git status\n\
         git show\n\
         git diff {commit}\n\
         {test_cmd} {tests}\n",
        dir = TESTBED_DIR,
        commit = base_commit,
        test_cmd = TEST_CMD_PLACEHOLDER,
        tests = TESTS_PLACEHOLDER,
    )
}
