//! Valid-name discovery by batched hash probing.
//!
//! Candidates are `"<base> (<n>)<.ext>"`. The first batch is the bare name
//! followed by `n = 1..=step`; batch `k > 0` covers
//! `n = k*step+1 ..= (k+1)*step`. Each batch is hashed and sent to the
//! server in one availability check; the first available candidate in
//! iteration order wins.

use sd_core::{NodeId, ShareId};
use sd_crypto::HashKey;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::DriveApi;
use crate::error::NamingError;
use crate::model::NameHashPair;

/// Computes the collision hash of a candidate name within one folder.
pub trait NameHasher: Send + Sync {
    fn hash(&self, name: &str) -> anyhow::Result<String>;
}

impl NameHasher for HashKey {
    fn hash(&self, name: &str) -> anyhow::Result<String> {
        Ok(sd_crypto::name_hash(self, name))
    }
}

pub struct ValidNameDiscoverer<'a> {
    api: &'a dyn DriveApi,
    step: usize,
}

impl<'a> ValidNameDiscoverer<'a> {
    pub fn new(api: &'a dyn DriveApi, step: usize) -> Self {
        Self { api, step: step.max(1) }
    }

    /// Find an available `(name, hash)` for `name` under `parent`.
    ///
    /// Hashes in `excluded` are treated as taken even if the server reports
    /// them available. Loops until a candidate is found, the availability
    /// check fails, or `cancel` fires; a cancelled search yields `Ok(None)`.
    pub async fn find_available(
        &self,
        share: &ShareId,
        parent: &NodeId,
        name: &str,
        hasher: &dyn NameHasher,
        excluded: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<NameHashPair>, NamingError> {
        let (base, ext) = split_extension(name);

        let mut window = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let batch = hash_batch(candidate_window(name, base, ext, window, self.step), hasher);
            if batch.is_empty() {
                return Err(NamingError::NoHashableCandidates);
            }

            let hashes: Vec<String> = batch
                .iter()
                .filter(|p| !excluded.contains(&p.hash))
                .map(|p| p.hash.clone())
                .collect();
            if hashes.is_empty() {
                window += 1;
                continue;
            }

            let available: HashSet<String> = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                res = self.api.check_available_hashes(share, parent, hashes) => {
                    res.map_err(NamingError::AvailabilityCheck)?.into_iter().collect()
                }
            };

            if let Some(found) = batch
                .into_iter()
                .find(|p| available.contains(&p.hash) && !excluded.contains(&p.hash))
            {
                debug!(window, name = %found.name, "found available name");
                return Ok(Some(found));
            }
            debug!(window, "no available name in batch");
            window += 1;
        }
    }
}

/// Names probed in window `window`.
pub fn candidate_window(name: &str, base: &str, ext: &str, window: usize, step: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(step + 1);
    if window == 0 {
        names.push(name.to_string());
    }
    let first = window * step + 1;
    for n in first..first + step {
        names.push(format!("{base} ({n}){ext}"));
    }
    names
}

fn hash_batch(names: Vec<String>, hasher: &dyn NameHasher) -> Vec<NameHashPair> {
    names
        .into_iter()
        .filter_map(|name| match hasher.hash(&name) {
            Ok(hash) => Some(NameHashPair { name, hash }),
            Err(e) => {
                warn!(name = %name, "skipping candidate, hashing failed: {e}");
                None
            }
        })
        .collect()
}

/// `"Report.pdf"` → `("Report", ".pdf")`. Dotfiles and names without a dot
/// have no extension.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(i) => name.split_at(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn split_extension_cases() {
        assert_eq!(split_extension("Report.pdf"), ("Report", ".pdf"));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("README"), ("README", ""));
    }

    #[test]
    fn first_window_starts_with_bare_name() {
        let names = candidate_window("Report.pdf", "Report", ".pdf", 0, 3);
        assert_eq!(
            names,
            vec!["Report.pdf", "Report (1).pdf", "Report (2).pdf", "Report (3).pdf"]
        );
    }

    #[test]
    fn later_windows_are_contiguous() {
        let names = candidate_window("a", "a", "", 2, 15);
        assert_eq!(names.first().unwrap(), "a (31)");
        assert_eq!(names.last().unwrap(), "a (45)");
    }

    #[tokio::test]
    async fn cancelled_search_finds_nothing() {
        let drive = crate::loopback::LoopbackDrive::new();
        let folder: sd_crypto::NodeKey = sd_crypto::generate_key();
        let hash_key = sd_crypto::derive_hash_key(&folder).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let found = ValidNameDiscoverer::new(&drive, 15)
            .find_available(
                &ShareId::new("S1"),
                &NodeId::new("P1"),
                "a.txt",
                &hash_key,
                &HashSet::new(),
                &cancel,
            )
            .await
            .unwrap();

        assert!(found.is_none());
    }

    proptest! {
        #[test]
        fn windows_never_overlap(step in 1usize..=20, k in 0usize..=10) {
            let a = candidate_window("f.txt", "f", ".txt", k, step);
            let b = candidate_window("f.txt", "f", ".txt", k + 1, step);
            let a: HashSet<_> = a.into_iter().collect();
            prop_assert!(b.iter().all(|n| !a.contains(n)));
        }
    }
}
