use super::graph::PrimIndexGraph;
use std::cmp::Ordering;
use std::collections::HashSet;

/// The kinds of work the indexer performs, declared in evaluation priority
/// order: earlier variants pop first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum TaskType {
	EvalNodeRelocations,
	EvalImpliedRelocations,
	EvalNodeReferences,
	EvalNodePayload,
	EvalNodeInherits,
	EvalImpliedClasses,
	EvalNodeSpecializes,
	EvalImpliedSpecializes,
	EvalNodeVariantSets,
	EvalNodeVariantAuthored,
	EvalNodeVariantFallback,
	EvalNodeVariantNoneFound,
}

impl TaskType {
	fn is_implied(&self) -> bool {
		matches!(
			self,
			TaskType::EvalImpliedClasses | TaskType::EvalImpliedSpecializes
		)
	}
}

/// A task to perform on a particular node.
#[derive(Debug, Clone)]
pub(crate) struct Task {
	pub task_type: TaskType,
	pub node: u16,
	pub vset_name: String,
	pub vset_num: u16,
}

impl Task {
	pub fn new(task_type: TaskType, node: u16) -> Self {
		Self {
			task_type,
			node,
			vset_name: String::new(),
			vset_num: 0,
		}
	}

	pub fn variant(task_type: TaskType, node: u16, vset_name: String, vset_num: u16) -> Self {
		Self {
			task_type,
			node,
			vset_name,
			vset_num,
		}
	}
}

/// The open-task queue of one indexing run.
///
/// Conceptually a max-heap over the total priority order below. Because
/// node strength participates in the order and changes as the graph grows,
/// priorities are evaluated against the live graph at pop time: the queue
/// scans for the current maximum instead of maintaining a sifted heap.
/// The order is total, so construction stays deterministic.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
	tasks: Vec<Task>,
	// Implied-class and implied-specializes tasks are deduplicated; the
	// propagation rules can enqueue the same node repeatedly.
	dedup: HashSet<(TaskType, u16)>,
}

impl TaskQueue {
	pub fn add(&mut self, task: Task) {
		if task.task_type.is_implied() && !self.dedup.insert((task.task_type, task.node)) {
			return;
		}
		self.tasks.push(task);
	}

	/// Remove and return the highest-priority task.
	pub fn pop(&mut self, graph: &PrimIndexGraph) -> Option<Task> {
		if self.tasks.is_empty() {
			return None;
		}

		let mut best = 0;
		for i in 1..self.tasks.len() {
			if Self::priority_order(&self.tasks[i], &self.tasks[best], graph) == Ordering::Greater
			{
				best = i;
			}
		}

		let task = self.tasks.remove(best);
		if task.task_type.is_implied() {
			self.dedup.remove(&(task.task_type, task.node));
		}
		Some(task)
	}

	/// Promote every pending fallback and none-found variant task back to
	/// an authored-variant task. Called when a newly inserted arc may have
	/// introduced stronger opinions that change a previous decision.
	pub fn retry_variant_tasks(&mut self) {
		for task in &mut self.tasks {
			if matches!(
				task.task_type,
				TaskType::EvalNodeVariantFallback | TaskType::EvalNodeVariantNoneFound
			) {
				task.task_type = TaskType::EvalNodeVariantAuthored;
			}
		}
	}

	// Greater means `a` pops before `b`.
	fn priority_order(a: &Task, b: &Task, graph: &PrimIndexGraph) -> Ordering {
		if a.task_type != b.task_type {
			// Earlier task types have higher priority.
			return b.task_type.cmp(&a.task_type);
		}

		match a.task_type {
			// Payloads can have dynamic file format arguments that depend
			// on non-local information, so process them in node strength
			// order.
			TaskType::EvalNodePayload => graph.compare_node_strength(b.node, a.node),
			// Variant selections can also depend on non-local information;
			// visit in strength order, lower-numbered sets first.
			TaskType::EvalNodeVariantAuthored | TaskType::EvalNodeVariantFallback => graph
				.compare_node_strength(b.node, a.node)
				.then(b.vset_num.cmp(&a.vset_num)),
			// None-found tasks only need a consistent, distinct order.
			TaskType::EvalNodeVariantNoneFound => {
				b.node.cmp(&a.node).then(b.vset_num.cmp(&a.vset_num))
			}
			// Descendant nodes must be processed before their ancestors.
			// Children always receive higher pool indices than their
			// parents, so index order suffices.
			TaskType::EvalImpliedClasses => a.node.cmp(&b.node),
			// Arbitrary but deterministic.
			_ => b.node.cmp(&a.node),
		}
	}
}
