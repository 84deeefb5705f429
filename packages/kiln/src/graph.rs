//! The frozen pip graph.
//!
//! A [`PipGraph`] is immutable after construction. Vertices are pips; edges
//! are declared producer/consumer relationships plus explicit order-only
//! edges (service pips, barriers). The builder resolves artifact references
//! to producers, assigns semi-stable hashes, and rejects cycles, so that the
//! scheduler can assume a DAG and never re-validate.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{OptionExt, bail},
};
use tracing::{debug, instrument};
use wire::ContentHash;

use crate::{
    paths::{PathId, PathTable},
    pip::{FileArtifact, Pip, PipId, PipPayload, SemiStableHash},
};

/// Mutable accumulator for a [`PipGraph`].
pub struct PipGraphBuilder {
    paths: Arc<PathTable>,
    pips: Vec<Pip>,
    /// Order-only edges added explicitly: (before, after).
    order_edges: Vec<(PipId, PipId)>,
    /// Producer of each declared output artifact.
    producers: HashMap<FileArtifact, PipId>,
}

impl PipGraphBuilder {
    pub fn new(paths: Arc<PathTable>) -> Self {
        Self {
            paths,
            pips: Vec::new(),
            order_edges: Vec::new(),
            producers: HashMap::new(),
        }
    }

    /// Add a pip, assigning the next dense id and a semi-stable hash derived
    /// from the payload's stable data (resolved paths, arguments, contents).
    pub fn add_pip(
        &mut self,
        payload: PipPayload,
        priority: u32,
        weight: u32,
        tags: Vec<String>,
    ) -> PipId {
        let id = PipId(self.pips.len() as u32);
        let semi_stable_hash = self.semi_stable_hash(&payload);
        let pip = Pip {
            id,
            semi_stable_hash,
            priority,
            weight: weight.max(1),
            tags,
            payload,
        };

        for output in pip.declared_file_outputs() {
            // Duplicate declared producers are recorded, not rejected: the
            // engine fails both producers at build start so neither reaches
            // Executed.
            self.producers.entry(output).or_insert(id);
        }

        self.pips.push(pip);
        id
    }

    /// Add an order-only edge: `after` never starts before `before`
    /// finishes, independent of artifact flow.
    pub fn add_order_edge(&mut self, before: PipId, after: PipId) {
        self.order_edges.push((before, after));
    }

    /// Pips, keyed by declared output, that collide with an earlier
    /// producer. The engine uses this to fail both sides of a declared
    /// double write.
    fn declared_double_writes(&self) -> Vec<(FileArtifact, Vec<PipId>)> {
        let mut by_output: HashMap<FileArtifact, Vec<PipId>> = HashMap::new();
        for pip in &self.pips {
            for output in pip.declared_file_outputs() {
                by_output.entry(output).or_default().push(pip.id);
            }
        }
        by_output
            .into_iter()
            .filter(|(_, producers)| producers.len() > 1)
            .collect()
    }

    /// Freeze into an immutable graph, or fail on a dependency cycle.
    #[instrument(skip(self))]
    pub fn build(self) -> Result<PipGraph> {
        let count = self.pips.len();
        let mut dependencies: Vec<BTreeSet<PipId>> = vec![BTreeSet::new(); count];

        for pip in &self.pips {
            for input in pip.declared_file_inputs() {
                if let Some(&producer) = self.producers.get(&input) {
                    if producer != pip.id {
                        dependencies[pip.id.0 as usize].insert(producer);
                    }
                }
            }
        }
        for (before, after) in &self.order_edges {
            if before != after {
                dependencies[after.0 as usize].insert(*before);
            } else {
                bail!("pip {before} cannot depend on itself");
            }
        }

        let mut dependents: Vec<BTreeSet<PipId>> = vec![BTreeSet::new(); count];
        for (consumer, deps) in dependencies.iter().enumerate() {
            for dep in deps {
                dependents[dep.0 as usize].insert(PipId(consumer as u32));
            }
        }

        let order = topological_order(&dependencies)?;
        let double_writes = self.declared_double_writes();
        debug!(
            pips = count,
            edges = dependencies.iter().map(BTreeSet::len).sum::<usize>(),
            "sealed pip graph"
        );

        Ok(PipGraph {
            paths: self.paths,
            pips: self.pips,
            dependencies,
            dependents,
            producers: self.producers,
            order,
            double_writes,
        })
    }

    fn semi_stable_hash(&self, payload: &PipPayload) -> SemiStableHash {
        let mut fields: Vec<Vec<u8>> = Vec::new();
        let mut push_path = |fields: &mut Vec<Vec<u8>>, path: PathId| {
            fields.push(self.paths.resolve_lossy(path).into_bytes());
        };

        match payload {
            PipPayload::Process(p) => {
                fields.push(b"process".to_vec());
                push_path(&mut fields, p.executable);
                for arg in &p.arguments {
                    fields.push(arg.clone().into_bytes());
                }
                for output in &p.outputs {
                    push_path(&mut fields, output.path);
                }
            }
            PipPayload::WriteFile(p) => {
                fields.push(b"write".to_vec());
                push_path(&mut fields, p.destination.path);
                fields.push(p.contents.clone().into_bytes());
            }
            PipPayload::CopyFile(p) => {
                fields.push(b"copy".to_vec());
                push_path(&mut fields, p.source.path);
                push_path(&mut fields, p.destination.path);
            }
            PipPayload::SealDirectory(p) => {
                fields.push(b"seal".to_vec());
                push_path(&mut fields, p.directory.path);
                fields.push(p.directory.kind.to_string().into_bytes());
            }
            PipPayload::Ipc(p) => {
                fields.push(b"ipc".to_vec());
                fields.push(p.moniker.clone().into_bytes());
                fields.push(p.payload.clone().into_bytes());
            }
            PipPayload::Meta => fields.push(b"meta".to_vec()),
        }

        let hash = ContentHash::from_fields(fields);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.digest()[..8]);
        SemiStableHash(u64::from_le_bytes(bytes))
    }
}

/// An immutable, acyclic graph of pips.
pub struct PipGraph {
    paths: Arc<PathTable>,
    pips: Vec<Pip>,
    dependencies: Vec<BTreeSet<PipId>>,
    dependents: Vec<BTreeSet<PipId>>,
    producers: HashMap<FileArtifact, PipId>,
    order: Vec<PipId>,
    double_writes: Vec<(FileArtifact, Vec<PipId>)>,
}

impl PipGraph {
    /// The path table the graph's artifacts are interned in.
    pub fn paths(&self) -> &Arc<PathTable> {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.pips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pips.is_empty()
    }

    pub fn pip(&self, id: PipId) -> Result<&Pip> {
        self.pips.get(id.0 as usize).ok_or_eyre(format!("unknown pip: {id}"))
    }

    pub fn pips(&self) -> impl Iterator<Item = &Pip> {
        self.pips.iter()
    }

    /// Direct dependencies of the pip.
    pub fn dependencies(&self, id: PipId) -> impl Iterator<Item = PipId> + '_ {
        self.dependencies[id.0 as usize].iter().copied()
    }

    /// Direct dependents of the pip.
    pub fn dependents(&self, id: PipId) -> impl Iterator<Item = PipId> + '_ {
        self.dependents[id.0 as usize].iter().copied()
    }

    /// The number of direct dependencies.
    pub fn dependency_count(&self, id: PipId) -> usize {
        self.dependencies[id.0 as usize].len()
    }

    /// A topological order over all pips.
    pub fn topological_order(&self) -> &[PipId] {
        &self.order
    }

    /// The unique producer of a declared output artifact, if any pip
    /// declares it.
    pub fn producer_of(&self, artifact: FileArtifact) -> Option<PipId> {
        self.producers.get(&artifact).copied()
    }

    /// Declared outputs with more than one declared producer.
    pub fn declared_double_writes(&self) -> &[(FileArtifact, Vec<PipId>)] {
        &self.double_writes
    }
}

/// Kahn's algorithm; fails if the graph has a cycle.
fn topological_order(dependencies: &[BTreeSet<PipId>]) -> Result<Vec<PipId>> {
    let count = dependencies.len();
    let mut indegree = vec![0usize; count];
    for (consumer, deps) in dependencies.iter().enumerate() {
        indegree[consumer] = deps.len();
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (consumer, deps) in dependencies.iter().enumerate() {
        for dep in deps {
            dependents[dep.0 as usize].push(consumer);
        }
    }

    let mut queue: VecDeque<usize> = (0..count).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(count);

    while let Some(next) = queue.pop_front() {
        order.push(PipId(next as u32));
        for &consumer in &dependents[next] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                queue.push_back(consumer);
            }
        }
    }

    if order.len() != count {
        bail!("pip graph contains a cycle");
    }
    Ok(order)
}
