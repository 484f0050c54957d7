use std::collections::HashMap;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{Config, TemplateAnat};
use crate::dataset::{Acquisition, Subject};
use crate::placement::{Artifact, Placement, PlacementPlan, Stage};
use crate::select::WorkSet;
use crate::task::{Task, TaskKind};

/// Template chosen for subjects that have PET data but no T1w image.
#[derive(Debug, Clone)]
pub struct Template {
    pub kind: TemplateAnat,
    /// Image to copy in. `None` when the template is derived from PET.
    pub image: Option<Utf8PathBuf>,
}

/// Switches that shape the task graph.
#[derive(Debug, Clone, Default)]
pub struct GraphOptions {
    pub anat_only: bool,
    pub preview: bool,
    pub template: Option<Template>,
}

impl GraphOptions {
    /// Options from the run configuration, with the template image already
    /// resolved by the caller.
    pub fn new(config: &Config, template: Option<Template>) -> Self {
        Self {
            anat_only: config.anat_only,
            preview: config.preview,
            template,
        }
    }
}

/// The task graph for a whole batch.
///
/// Edges point from a dependency to its dependent. The graph is acyclic by
/// construction and never connects tasks of two different subjects.
#[derive(Debug, Default)]
pub struct TaskGraph {
    pub(crate) graph: Graph<Task, ()>,
    /// Subjects with PET data but nothing to register it onto.
    pub unprocessable: Vec<String>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    /// Direct dependencies of `index`.
    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph
            .neighbors_directed(index, petgraph::Direction::Incoming)
    }

    /// `(dependency, dependent)` pairs.
    pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex)> + '_ {
        self.graph
            .raw_edges()
            .iter()
            .map(|edge| (edge.source(), edge.target()))
    }
}

impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for (source, target) in self.edges() {
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        Ok(())
    }
}

/// Incrementally assembles a [`TaskGraph`].
pub struct Blueprint {
    graph: Graph<Task, ()>,
    unprocessable: Vec<String>,
}

/// Node that provides a registration target and its face mask.
#[derive(Debug, Clone)]
struct Provider {
    index: NodeIndex,
    reference: Utf8PathBuf,
    facemask: Utf8PathBuf,
}

impl Blueprint {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            unprocessable: Vec::new(),
        }
    }

    pub fn finish(self) -> TaskGraph {
        TaskGraph {
            graph: self.graph,
            unprocessable: self.unprocessable,
        }
    }

    fn add_task(&mut self, task: Task, dependencies: &[NodeIndex]) -> NodeIndex {
        let index = self.graph.add_node(task);

        for &dependency in dependencies {
            self.graph.add_edge(dependency, index, ());
        }

        index
    }

    /// Adds every task of one subject.
    pub fn add_subject(&mut self, subject: &Subject, plan: &PlacementPlan, options: &GraphOptions) {
        let mut anatomicals: HashMap<&Utf8Path, Provider> = HashMap::new();

        for anat in subject.anatomicals() {
            let provider = self.add_anat_deface(anat, plan, options.preview);
            anatomicals.insert(&anat.relative, provider);
        }

        if options.anat_only || subject.paired().next().is_none() {
            return;
        }

        if subject.has_anatomical() {
            if options.template.is_some() {
                tracing::debug!("sub-{} has a T1w image, template not used", subject.id);
            }
        } else if options.template.is_none() {
            tracing::warn!(
                "sub-{} has PET data but no T1w image, skipping (see --use_template_anat)",
                subject.id
            );
            self.unprocessable.push(subject.id.clone());
            return;
        }

        for pet in subject.paired() {
            let provider = match subject.best_anatomical(pet) {
                Some(anat) => anatomicals.get(anat.relative.as_path()).cloned(),
                None => options
                    .template
                    .as_ref()
                    .map(|template| self.add_template_substitute(pet, plan, template)),
            };

            // Unreachable: either an anatomical or a template exists here.
            let Some(provider) = provider else {
                continue;
            };

            let transform = plan.resolve(Artifact::Transform(pet));
            let register = self.add_task(
                Task::new(
                    pet,
                    TaskKind::Register {
                        moving: pet.image.clone(),
                        average: plan.resolve(Artifact::Average(pet)),
                        reference: provider.reference.clone(),
                        transform: transform.clone(),
                    },
                ),
                &[provider.index],
            );

            self.add_task(
                Task::new(
                    pet,
                    TaskKind::ModalityDeface {
                        image: pet.image.clone(),
                        facemask: provider.facemask.clone(),
                        transform,
                        defaced: plan.resolve(Artifact::Defaced(pet)),
                        record: plan.resolve(Artifact::Record(pet)),
                    },
                ),
                &[register, provider.index],
            );
        }
    }

    fn add_anat_deface(&mut self, anat: &Acquisition, plan: &PlacementPlan, preview: bool) -> Provider {
        let defaced = plan.resolve(Artifact::Defaced(anat));
        let facemask = plan.resolve(Artifact::FaceMask(anat));

        let index = self.add_task(
            Task::new(
                anat,
                TaskKind::AnatDeface {
                    anat: anat.image.clone(),
                    defaced: defaced.clone(),
                    facemask: facemask.clone(),
                },
            ),
            &[],
        );

        if preview {
            let overwritten = defaced == anat.image;
            let (original, before) = if overwritten {
                (None, None)
            } else {
                (
                    Some(anat.image.clone()),
                    Some(plan.resolve(Artifact::Preview(anat, Stage::Before))),
                )
            };

            self.add_task(
                Task::new(
                    anat,
                    TaskKind::Preview {
                        original,
                        defaced: defaced.clone(),
                        before,
                        after: plan.resolve(Artifact::Preview(anat, Stage::After)),
                    },
                ),
                &[index],
            );
        }

        Provider {
            index,
            reference: defaced,
            facemask,
        }
    }

    fn add_template_substitute(
        &mut self,
        pet: &Acquisition,
        plan: &PlacementPlan,
        template: &Template,
    ) -> Provider {
        let anat = plan.resolve(Artifact::Template(pet, template.kind));
        let facemask = plan.resolve(Artifact::TemplateMask(pet, template.kind));
        let source = template.image.clone().unwrap_or_else(|| pet.image.clone());

        let index = self.add_task(
            Task::new(
                pet,
                TaskKind::TemplateSubstitute {
                    template: template.kind,
                    source,
                    anat: anat.clone(),
                    facemask: facemask.clone(),
                },
            ),
            &[],
        );

        Provider {
            index,
            reference: anat,
            facemask,
        }
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the task graph of every selected subject.
pub fn build_graph(work: &WorkSet, placement: &Placement, options: &GraphOptions) -> TaskGraph {
    let mut blueprint = Blueprint::new();

    for subject in &work.subjects {
        blueprint.add_subject(subject, &placement.plan(subject), options);
    }

    let graph = blueprint.finish();
    tracing::info!(
        "planned {} tasks for {} subjects",
        graph.len(),
        work.subjects.len()
    );
    graph
}
