//! ORB vocabulary for Bag-of-Words place recognition.
//!
//! A DBoW2 hierarchical k-means tree trained on ORB descriptors, loaded from
//! the text format shipped with ORB-SLAM2 (`ORBvoc.txt`). Relocalization
//! uses the [`BowVector`] to find candidate keyframes and the
//! [`FeatureVector`] to restrict descriptor comparisons to features that fall
//! under the same tree node.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::tracking::frame::{descriptor_distance, Descriptor};

/// Bag-of-Words vector: word_id -> L1-normalized TF-IDF weight.
pub type BowVector = HashMap<u32, f64>;

/// Feature vector: node_id -> indices of the features below that node.
pub type FeatureVector = HashMap<u32, Vec<usize>>;

/// Levels above the leaves used to group features for BoW matching.
pub const FEATURE_VECTOR_LEVELS_UP: usize = 4;

/// Errors that can occur when loading a vocabulary.
#[derive(Debug, Error)]
pub enum VocabularyError {
    #[error("vocabulary I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("vocabulary parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("vocabulary has no words")]
    Empty,
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<u32>,
    children: Vec<u32>,
    descriptor: Descriptor,
    weight: f64,
    word_id: Option<u32>,
}

impl Node {
    fn root() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            descriptor: [0u8; 32],
            weight: 0.0,
            word_id: None,
        }
    }
}

/// The vocabulary tree.
#[derive(Debug)]
pub struct Vocabulary {
    nodes: Vec<Node>,
    /// Word id -> node id.
    words: Vec<u32>,
    k: usize,
    l: usize,
}

impl Vocabulary {
    /// Load from a DBoW2 text file.
    ///
    /// ```text
    /// k L scoring weighting
    /// parent_id is_leaf d0 d1 ... d31 weight
    /// ...
    /// ```
    ///
    /// Node lines are numbered from 1 in file order; node 0 is the root.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, VocabularyError> {
        let mut lines = reader.lines();
        let parse_err = |line: usize, reason: &str| VocabularyError::Parse {
            line,
            reason: reason.to_string(),
        };

        let header = lines.next().ok_or(VocabularyError::Empty)??;
        let mut header_parts = header.split_whitespace();
        let k: usize = header_parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_err(1, "invalid branching factor"))?;
        let l: usize = header_parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_err(1, "invalid depth"))?;

        let mut nodes = vec![Node::root()];
        let mut words = Vec::new();

        for (idx, line) in lines.enumerate() {
            let line_no = idx + 2;
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }
            if parts.len() < 35 {
                return Err(parse_err(line_no, "expected parent, leaf flag, 32 bytes and weight"));
            }

            let parent: u32 = parts[0]
                .parse()
                .map_err(|_| parse_err(line_no, "invalid parent id"))?;
            if parent as usize >= nodes.len() {
                return Err(parse_err(line_no, "parent id refers to an unknown node"));
            }

            let mut descriptor = [0u8; 32];
            for (byte, text) in descriptor.iter_mut().zip(&parts[2..34]) {
                *byte = text
                    .parse()
                    .map_err(|_| parse_err(line_no, "invalid descriptor byte"))?;
            }
            let weight: f64 = parts[34]
                .parse()
                .map_err(|_| parse_err(line_no, "invalid weight"))?;

            let node_id = nodes.len() as u32;
            let word_id = if parts[1] == "1" {
                words.push(node_id);
                Some(words.len() as u32 - 1)
            } else {
                None
            };
            nodes[parent as usize].children.push(node_id);
            nodes.push(Node {
                parent: Some(parent),
                children: Vec::new(),
                descriptor,
                weight,
                word_id,
            });
        }

        if words.is_empty() {
            return Err(VocabularyError::Empty);
        }

        info!(
            "Loaded vocabulary: k={}, L={}, {} nodes, {} words",
            k,
            l,
            nodes.len(),
            words.len()
        );

        Ok(Self { nodes, words, k, l })
    }

    /// Branching factor and depth.
    pub fn params(&self) -> (usize, usize) {
        (self.k, self.l)
    }

    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Descend the tree following the closest child. Returns the leaf node id.
    fn quantize(&self, desc: &Descriptor) -> usize {
        let mut node_id = 0usize;
        while let Some(&first) = self.nodes[node_id].children.first() {
            let mut best = first as usize;
            let mut best_dist = descriptor_distance(desc, &self.nodes[best].descriptor);
            for &child in &self.nodes[node_id].children[1..] {
                let dist = descriptor_distance(desc, &self.nodes[child as usize].descriptor);
                if dist < best_dist {
                    best_dist = dist;
                    best = child as usize;
                }
            }
            node_id = best;
        }
        node_id
    }

    fn ancestor(&self, node_id: usize, levels_up: usize) -> usize {
        let mut id = node_id;
        for _ in 0..levels_up {
            match self.nodes[id].parent {
                Some(p) if p != 0 => id = p as usize,
                _ => break,
            }
        }
        id
    }

    /// Word id of a single descriptor.
    pub fn word_of(&self, desc: &Descriptor) -> Option<u32> {
        self.nodes[self.quantize(desc)].word_id
    }

    /// BoW and feature vectors for a set of descriptors.
    pub fn transform(&self, descriptors: &[Descriptor], levels_up: usize) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut feat = FeatureVector::new();

        for (i, desc) in descriptors.iter().enumerate() {
            let leaf = self.quantize(desc);
            let node = &self.nodes[leaf];
            let Some(word_id) = node.word_id else {
                continue;
            };
            *bow.entry(word_id).or_insert(0.0) += node.weight;
            feat.entry(self.ancestor(leaf, levels_up) as u32)
                .or_default()
                .push(i);
        }

        normalize_l1(&mut bow);
        (bow, feat)
    }

    /// L1 similarity: `1 - 0.5 |v1 - v2|₁`, in `[0, 1]`.
    pub fn score(v1: &BowVector, v2: &BowVector) -> f64 {
        let mut diff: f64 = v1
            .iter()
            .map(|(w, a)| (a - v2.get(w).copied().unwrap_or(0.0)).abs())
            .sum();
        diff += v2
            .iter()
            .filter(|(w, _)| !v1.contains_key(w))
            .map(|(_, b)| b.abs())
            .sum::<f64>();
        1.0 - 0.5 * diff
    }
}

fn normalize_l1(bow: &mut BowVector) {
    let sum: f64 = bow.values().map(|v| v.abs()).sum();
    if sum > 0.0 {
        for v in bow.values_mut() {
            *v /= sum;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Two words: descriptors with all bits clear map to word 0, all bits
    /// set map to word 1.
    pub(crate) const TINY_VOCABULARY: &str = "2 1 0 0
0 1 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 0 1.0
0 1 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 255 1.0
";

    pub(crate) fn tiny() -> Vocabulary {
        Vocabulary::from_reader(Cursor::new(TINY_VOCABULARY)).unwrap()
    }

    #[test]
    fn test_parse_tiny_vocabulary() {
        let vocab = tiny();
        assert_eq!(vocab.params(), (2, 1));
        assert_eq!(vocab.num_words(), 2);
        assert_eq!(vocab.num_nodes(), 3);
        assert_eq!(vocab.word_of(&[0x01; 32]), Some(0));
        assert_eq!(vocab.word_of(&[0xfe; 32]), Some(1));
    }

    #[test]
    fn test_transform_groups_features() {
        let vocab = tiny();
        let descs = [[0u8; 32], [0xffu8; 32], [0x03u8; 32]];
        let (bow, feat) = vocab.transform(&descs, 0);

        assert!((bow[&0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((bow[&1] - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(feat.values().map(Vec::len).sum::<usize>(), 3);
    }

    #[test]
    fn test_bow_score() {
        let mut v1 = BowVector::new();
        v1.insert(0, 0.5);
        v1.insert(1, 0.5);

        assert!((Vocabulary::score(&v1, &v1.clone()) - 1.0).abs() < 1e-10);

        let mut v3 = BowVector::new();
        v3.insert(2, 0.5);
        v3.insert(3, 0.5);
        assert!(Vocabulary::score(&v1, &v3) < 0.01);
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(matches!(
            Vocabulary::from_reader(Cursor::new("")),
            Err(VocabularyError::Empty)
        ));
        assert!(matches!(
            Vocabulary::from_reader(Cursor::new("10 6 0 0\n0 1 12\n")),
            Err(VocabularyError::Parse { line: 2, .. })
        ));
        assert!(matches!(
            Vocabulary::from_reader(Cursor::new("10 6 0 0\n")),
            Err(VocabularyError::Empty)
        ));
    }

    #[test]
    #[ignore] // Takes several seconds to load the full vocabulary
    fn test_load_orbslam_vocabulary() {
        let vocab_path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("data/ORBvoc.txt");
        if !vocab_path.exists() {
            eprintln!("Skipping test: {} not found", vocab_path.display());
            return;
        }
        let vocab = Vocabulary::load(&vocab_path).expect("Failed to load vocabulary");
        assert_eq!(vocab.params(), (10, 6));
        assert!(vocab.num_words() > 90_000);
    }
}
