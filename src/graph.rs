use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    fs,
    path::PathBuf,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::util::{now_unix_secs, write_atomic};

const GRAPH_VERSION: u32 = 1;

/// Outbound references of one parsed document. Edge lists are deduplicated
/// and kept in insertion order; targets need not have nodes of their own
/// (leaf resources dangle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub url: String,
    pub hyperlinks: Vec<String>,
    pub resources: Vec<String>,
    pub last_parsed: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphManifest {
    version: u32,
    last_updated: i64,
    nodes: BTreeMap<String, GraphNode>,
}

/// The content-link graph, persisted as `graph.json`. A run loads the
/// previous graph read-only (for 304 carry-forward) and writes a fresh one;
/// disk reconciliation happens afterwards against the fresh graph.
#[derive(Debug)]
pub struct LinkGraph {
    path: PathBuf,
    manifest: GraphManifest,
}

impl LinkGraph {
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            manifest: GraphManifest {
                version: GRAPH_VERSION,
                last_updated: 0,
                nodes: BTreeMap::new(),
            },
        }
    }

    /// Like the validator cache, the graph is reconstructible: unreadable or
    /// version-skewed manifests degrade to empty.
    pub fn load(path: PathBuf) -> Self {
        let manifest = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<GraphManifest>(&bytes) {
                Ok(m) if m.version == GRAPH_VERSION => m,
                Ok(m) => {
                    warn!(path = %path.display(), version = m.version, "graph manifest version mismatch, starting empty");
                    GraphManifest {
                        version: GRAPH_VERSION,
                        last_updated: 0,
                        nodes: BTreeMap::new(),
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable graph manifest, starting empty");
                    GraphManifest {
                        version: GRAPH_VERSION,
                        last_updated: 0,
                        nodes: BTreeMap::new(),
                    }
                }
            },
            Err(_) => GraphManifest {
                version: GRAPH_VERSION,
                last_updated: 0,
                nodes: BTreeMap::new(),
            },
        };
        Self { path, manifest }
    }

    pub fn node(&self, url: &str) -> Option<&GraphNode> {
        self.manifest.nodes.get(url)
    }

    pub fn insert(&mut self, node: GraphNode) {
        self.manifest.nodes.insert(node.url.clone(), node);
    }

    pub fn len(&self) -> usize {
        self.manifest.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.nodes.is_empty()
    }

    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.manifest.nodes.keys().map(|k| k.as_str())
    }

    /// BFS over hyperlink and subresource edges from the given seeds. Seeds
    /// themselves are always reachable, with or without a node.
    pub fn reachable_from<'a, I>(&self, seeds: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut reachable: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for seed in seeds {
            if reachable.insert(seed.to_string()) {
                queue.push_back(seed.to_string());
            }
        }

        while let Some(url) = queue.pop_front() {
            let Some(node) = self.manifest.nodes.get(&url) else {
                continue;
            };
            for target in node.hyperlinks.iter().chain(node.resources.iter()) {
                if reachable.insert(target.clone()) {
                    queue.push_back(target.clone());
                }
            }
        }

        reachable
    }

    pub fn save(&mut self) -> Result<()> {
        self.manifest.last_updated = now_unix_secs();
        let bytes =
            serde_json::to_vec_pretty(&self.manifest).context("failed to serialize graph manifest")?;
        write_atomic(&self.path, &bytes)
            .with_context(|| format!("failed to write graph manifest: {}", self.path.display()))
    }
}
