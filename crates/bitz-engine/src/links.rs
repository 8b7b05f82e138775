use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::Result;
use serde::Serialize;

use bitz_contracts::errors::QuestError;

use crate::provider::{system_message, user_message, CompletionRequest, VisionProvider};

pub const MAX_BATCH_PAIRS: usize = 10;

const LINK_PROMPT: &str = r#"You are a helpful assistant that links species by their common or scientific names using short relationship phrases or common characteristics (1-3 words) with action verbs.
Action verbs can be such as eats, is eaten by, pollinates, is pollinated by, parasitizes, is parasitized by, feeds on, is host to, shares habitat, competes with, nests in,
shelters, lays eggs on, mutualism with, camouflages in, mimics, disperses seeds of, is preyed on by, infects, provides nutrients to, prefers wet soil, well drained soil,
sandy soil, shade tolerant, needs a lot of sun, or mutualistic; if the relationship is unclear, respond with an empty string (""), otherwise provide a short phrase.
"#;

/// Memoizes relationship phrases between unordered species-name pairs.
///
/// Keys are canonicalized (lower-case, trimmed, sorted) so order and
/// casing never cause a miss for logically identical pairs. Entries
/// never expire; an empty string is a valid cached value meaning "no
/// relationship". The map lock only guards slot lookup; resolution is
/// serialized per key, so two concurrent misses on one pair trigger a
/// single provider call and the loser reads the winner's value.
#[derive(Default)]
pub struct SpeciesLinkCache {
    entries: Mutex<HashMap<Vec<String>, Arc<Mutex<Option<String>>>>>,
}

impl SpeciesLinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-key slot, created empty on first sight.
    fn slot(&self, names: &[String]) -> Option<Arc<Mutex<Option<String>>>> {
        let key = canonical_pair_key(names);
        let mut entries = self.entries.lock().ok()?;
        Some(Arc::clone(
            entries.entry(key).or_insert_with(Arc::default),
        ))
    }

    pub fn lookup(&self, names: &[String]) -> Option<String> {
        let key = canonical_pair_key(names);
        let entries = self.entries.lock().ok()?;
        let value = entries.get(&key)?.lock().ok()?.clone();
        value
    }

    pub fn store(&self, names: &[String], link: &str) {
        if let Some(slot) = self.slot(names) {
            if let Ok(mut value) = slot.lock() {
                *value = Some(link.to_string());
            }
        }
    }

    /// Resolved entries only; in-flight slots do not count.
    pub fn len(&self) -> usize {
        let Ok(entries) = self.entries.lock() else {
            return 0;
        };
        entries
            .values()
            .filter(|slot| matches!(slot.lock().as_deref(), Ok(Some(_))))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn canonical_pair_key(names: &[String]) -> Vec<String> {
    let mut key: Vec<String> = names
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();
    key.sort();
    key
}

/// One per-pair outcome; a failed pair never fails the batch.
#[derive(Debug, Clone, Serialize)]
pub struct LinkResult {
    pub pair: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolves a batch of pairs, fanning misses out over one thread per
/// pair (the batch cap doubles as the concurrency bound). Results come
/// back in input order regardless of completion order.
pub fn link_batch(
    cache: &SpeciesLinkCache,
    provider: &Arc<dyn VisionProvider>,
    pairs: &[Vec<String>],
) -> Result<Vec<LinkResult>, QuestError> {
    if pairs.is_empty() {
        return Err(QuestError::Validation(
            "no species pairs provided".to_string(),
        ));
    }
    if pairs.len() > MAX_BATCH_PAIRS {
        return Err(QuestError::Validation(format!(
            "too many species pairs provided, maximum {MAX_BATCH_PAIRS} allowed"
        )));
    }
    for (index, pair) in pairs.iter().enumerate() {
        if pair.is_empty() {
            return Err(QuestError::Validation(format!(
                "species pair {index} is empty"
            )));
        }
        if pair.len() > 2 {
            return Err(QuestError::Validation(format!(
                "species pair {index} has too many species, maximum 2 allowed"
            )));
        }
    }

    let results = thread::scope(|scope| {
        let handles: Vec<_> = pairs
            .iter()
            .map(|pair| scope.spawn(move || link_single(cache, provider, pair)))
            .collect();
        handles
            .into_iter()
            .zip(pairs)
            .map(|(handle, pair)| match handle.join() {
                Ok(result) => result,
                Err(_) => LinkResult {
                    pair: pair.clone(),
                    link: None,
                    cached: false,
                    error: Some("link worker panicked".to_string()),
                },
            })
            .collect::<Vec<LinkResult>>()
    });
    Ok(results)
}

fn link_single(
    cache: &SpeciesLinkCache,
    provider: &Arc<dyn VisionProvider>,
    pair: &[String],
) -> LinkResult {
    let Some(slot) = cache.slot(pair) else {
        return LinkResult {
            pair: pair.to_vec(),
            link: None,
            cached: false,
            error: Some("link cache unavailable".to_string()),
        };
    };
    let Ok(mut value) = slot.lock() else {
        return LinkResult {
            pair: pair.to_vec(),
            link: None,
            cached: false,
            error: Some("link cache entry poisoned".to_string()),
        };
    };
    if let Some(link) = value.as_ref() {
        return LinkResult {
            pair: pair.to_vec(),
            link: Some(link.clone()),
            cached: true,
            error: None,
        };
    }

    let request = CompletionRequest::new(vec![
        system_message(LINK_PROMPT),
        user_message(&format!("Link these species: {}", pair.join(", "))),
    ])
    .with_max_tokens(256);

    match provider.complete(&request) {
        Ok(raw) => {
            let link = raw.trim().trim_matches('"').to_string();
            *value = Some(link.clone());
            LinkResult {
                pair: pair.to_vec(),
                link: Some(link),
                cached: false,
                error: None,
            }
        }
        // the slot stays empty; the next request retries
        Err(err) => LinkResult {
            pair: pair.to_vec(),
            link: None,
            cached: false,
            error: Some(format!("{err:#}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use crate::provider::ScriptedProvider;

    use super::*;

    fn pair(a: &str, b: &str) -> Vec<String> {
        vec![a.to_string(), b.to_string()]
    }

    fn provider_with(replies: Vec<String>) -> Arc<dyn VisionProvider> {
        Arc::new(ScriptedProvider::new(replies))
    }

    #[test]
    fn canonicalization_ignores_case_order_and_whitespace() {
        let cache = SpeciesLinkCache::new();
        cache.store(&pair("Vulpes vulpes", "Lepus europaeus"), "eats");

        assert_eq!(
            cache.lookup(&pair("  lepus europaeus ", "VULPES VULPES")),
            Some("eats".to_string())
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn empty_string_is_a_valid_cached_link() {
        let cache = SpeciesLinkCache::new();
        cache.store(&pair("a", "b"), "");
        assert_eq!(cache.lookup(&pair("b", "a")), Some(String::new()));
    }

    #[test]
    fn batch_preserves_input_order_and_length() -> anyhow::Result<()> {
        let cache = SpeciesLinkCache::new();
        cache.store(&pair("a", "b"), "shares habitat");
        let provider = provider_with(vec!["\"eats\"".to_string()]);

        let pairs = vec![pair("c", "d"), pair("a", "b")];
        let results = link_batch(&cache, &provider, &pairs)?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].pair, pair("c", "d"));
        assert_eq!(results[0].link.as_deref(), Some("eats"));
        assert!(!results[0].cached);
        assert_eq!(results[1].link.as_deref(), Some("shares habitat"));
        assert!(results[1].cached);
        Ok(())
    }

    #[test]
    fn repeated_batch_hits_cache() -> anyhow::Result<()> {
        let cache = SpeciesLinkCache::new();
        let provider = provider_with(vec!["pollinates".to_string()]);
        let pairs = vec![pair("Apis mellifera", "Trifolium repens")];

        let first = link_batch(&cache, &provider, &pairs)?;
        assert!(!first[0].cached);
        let second = link_batch(&cache, &provider, &pairs)?;
        assert!(second[0].cached);
        assert_eq!(first[0].link, second[0].link);
        Ok(())
    }

    #[test]
    fn concurrent_misses_on_one_pair_call_the_provider_once() -> anyhow::Result<()> {
        let cache = SpeciesLinkCache::new();
        let scripted = Arc::new(ScriptedProvider::new(vec!["eats".to_string()]));
        let provider: Arc<dyn VisionProvider> = Arc::clone(&scripted) as Arc<dyn VisionProvider>;

        let pairs = vec![pair("a", "b"); 4];
        let results = link_batch(&cache, &provider, &pairs)?;

        assert_eq!(scripted.calls(), 1);
        assert!(results
            .iter()
            .all(|result| result.link.as_deref() == Some("eats")));
        assert_eq!(
            results.iter().filter(|result| !result.cached).count(),
            1
        );
        Ok(())
    }

    #[test]
    fn one_failing_pair_does_not_fail_the_batch() -> anyhow::Result<()> {
        let cache = SpeciesLinkCache::new();
        // one reply for two uncached pairs: the second call fails
        let provider = provider_with(vec!["eats".to_string()]);
        let pairs = vec![pair("a", "b"), pair("c", "d")];

        let results = link_batch(&cache, &provider, &pairs)?;
        assert_eq!(results.len(), 2);
        let errors = results
            .iter()
            .filter(|result| result.error.is_some())
            .count();
        assert_eq!(errors, 1);
        Ok(())
    }

    #[test]
    fn validation_rejects_before_any_work() {
        let cache = SpeciesLinkCache::new();
        let provider = provider_with(Vec::new());

        assert!(matches!(
            link_batch(&cache, &provider, &[]),
            Err(QuestError::Validation(_))
        ));
        let oversized = vec![pair("a", "b"); MAX_BATCH_PAIRS + 1];
        assert!(matches!(
            link_batch(&cache, &provider, &oversized),
            Err(QuestError::Validation(_))
        ));
        let triple = vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]];
        assert!(matches!(
            link_batch(&cache, &provider, &triple),
            Err(QuestError::Validation(_))
        ));
        let empty_pair = vec![Vec::new()];
        assert!(matches!(
            link_batch(&cache, &provider, &empty_pair),
            Err(QuestError::Validation(_))
        ));
    }

    #[test]
    fn single_name_pairs_are_allowed() -> anyhow::Result<()> {
        let cache = SpeciesLinkCache::new();
        let provider = provider_with(vec!["shade tolerant".to_string()]);
        let results = link_batch(&cache, &provider, &[vec!["Fagus sylvatica".to_string()]])?;
        assert_eq!(results[0].link.as_deref(), Some("shade tolerant"));
        Ok(())
    }
}
