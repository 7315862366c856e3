//! Operator Shapes
//!
//! Most signals combine the samples of other signals in one of three
//! shapes. This module provides nodes for each, so an operator only has to
//! say what it does with the samples:
//!
//! - [`Convert`]: one input, mapped to an output of possibly another type.
//! - [`Combine`]: two inputs of the same type, merged into one sample.
//! - [`Fold`]: any number of inputs, accumulated from an initial sample.
//!
//! # Inputs
//!
//! Every input is a [`Value`](super::value) owned by the operator, so it can
//! be rewired at runtime and goes away with the operator. The operator runs
//! at the clock its non-constant inputs share; inputs on different clocks
//! are rejected, at construction and when rewired later on.

use std::any::{type_name, Any};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeBody, NodeId, NodeKind, SignalId, Slot, ValueId};

use super::context::Context;
use super::sink::shared_clock;
use super::value::Source;

/// Maps one input sample to an output sample.
pub trait Convert<In, Out>: Send + 'static {
    fn convert_sample(&mut self, input: &In, out: &mut Out);
}

impl<In, Out, F> Convert<In, Out> for F
where
    F: FnMut(&In) -> Out + Send + 'static,
{
    fn convert_sample(&mut self, input: &In, out: &mut Out) {
        *out = self(input);
    }
}

/// Merges two input samples into an output sample.
pub trait Combine<T>: Send + 'static {
    fn combine_samples(&mut self, left: &T, right: &T, out: &mut T);
}

impl<T, F> Combine<T> for F
where
    F: FnMut(&T, &T) -> T + Send + 'static,
{
    fn combine_samples(&mut self, left: &T, right: &T, out: &mut T) {
        *out = self(left, right);
    }
}

/// Accumulates any number of input samples into one.
///
/// Sums and products are typical folds: they start from `0` and `1`
/// respectively and apply `+` or `*` for each input.
pub trait Fold: Send + 'static {
    type Input: Clone + Default + Send + 'static;
    type Output: Clone + Default + Send + 'static;

    /// The sample the first input is folded into.
    fn init(&self) -> Self::Output;

    /// Fold one input sample into the accumulated sample.
    fn fold(&self, acc: Self::Output, input: &Self::Input) -> Self::Output;

    /// The constant new inputs start out with when the fold is resized.
    fn default_input(&self) -> Self::Input {
        Self::Input::default()
    }
}

/// A unary operator and its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryHandle<In, Out> {
    /// The operator's output.
    pub output: SignalId<Out>,
    /// The input, owned by the operator.
    pub input: ValueId<In>,
}

/// A binary operator and its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryHandle<T> {
    /// The operator's output.
    pub output: SignalId<T>,
    /// The left input, owned by the operator.
    pub left: ValueId<T>,
    /// The right input, owned by the operator.
    pub right: ValueId<T>,
}

/// A fold and its inputs at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldHandle<In, Out> {
    /// The fold's output.
    pub output: SignalId<Out>,
    /// The inputs it was built with, owned by the fold.
    pub inputs: Vec<ValueId<In>>,
}

struct UnaryOperation<C, In, Out> {
    converter: C,
    input: ValueId<In>,
    marker: PhantomData<fn() -> Out>,
}

impl<C, In, Out> NodeBody for UnaryOperation<C, In, Out>
where
    C: Convert<In, Out>,
    In: Clone + Default + Send + 'static,
    Out: Clone + Default + Send + 'static,
{
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let input = cx.pull(self.input)?;
        let mut out = cx.cached::<Out>()?;
        self.converter.convert_sample(&input, &mut out);
        cx.store(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct BinaryOperation<C, T> {
    combiner: C,
    left: ValueId<T>,
    right: ValueId<T>,
}

impl<C, T> NodeBody for BinaryOperation<C, T>
where
    C: Combine<T>,
    T: Clone + Default + Send + 'static,
{
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        let left = cx.pull(self.left)?;
        let right = cx.pull(self.right)?;
        let mut out = cx.cached::<T>()?;
        self.combiner.combine_samples(&left, &right, &mut out);
        cx.store(out)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct FoldOperation<F: Fold> {
    folder: F,
    inputs: Vec<ValueId<F::Input>>,
}

impl<F: Fold> NodeBody for FoldOperation<F> {
    fn run(&mut self, cx: &mut Context<'_>) -> Result<()> {
        if self.inputs.is_empty() {
            return cx.store(F::Output::default());
        }

        let mut acc = self.folder.init();
        for input in &self.inputs {
            let sample = cx.pull(*input)?;
            acc = self.folder.fold(acc, &sample);
        }
        cx.store(acc)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Graph {
    /// Add an operator converting the samples of `input`.
    ///
    /// ```rust
    /// use tickgraph_core::{Graph, Source};
    ///
    /// let mut graph = Graph::new();
    /// let half = graph.insert_unary(|x: &f32| x * 0.5, Source::Constant(3.0_f32))?;
    /// assert_eq!(graph.pull(half.output)?, 1.5);
    ///
    /// graph.set_constant(half.input, 5.0)?;
    /// assert_eq!(graph.pull(half.output)?, 2.5);
    /// # Ok::<(), tickgraph_core::Error>(())
    /// ```
    pub fn insert_unary<In, Out, C>(
        &mut self,
        converter: C,
        input: impl Into<Source<In>>,
    ) -> Result<UnaryHandle<In, Out>>
    where
        In: Clone + Default + Send + 'static,
        Out: Clone + Default + Send + 'static,
        C: Convert<In, Out>,
    {
        let sources = vec![input.into()];
        let clock = self.prepare_inputs(&sources)?;
        let inputs = self.insert_inputs(sources)?;
        let input = inputs[0];

        let body = UnaryOperation {
            converter,
            input,
            marker: PhantomData,
        };
        let output = self.insert_operator::<Out>(clock.as_ref(), Box::new(body), &[input.id()])?;
        Ok(UnaryHandle { output, input })
    }

    /// Add an operator combining the samples of `left` and `right`.
    pub fn insert_binary<T, C>(
        &mut self,
        combiner: C,
        left: impl Into<Source<T>>,
        right: impl Into<Source<T>>,
    ) -> Result<BinaryHandle<T>>
    where
        T: Clone + Default + Send + 'static,
        C: Combine<T>,
    {
        let sources = vec![left.into(), right.into()];
        let clock = self.prepare_inputs(&sources)?;
        let inputs = self.insert_inputs(sources)?;
        let (left, right) = (inputs[0], inputs[1]);

        let body = BinaryOperation {
            combiner,
            left,
            right,
        };
        let output = self.insert_operator::<T>(clock.as_ref(), Box::new(body), &[left.id(), right.id()])?;
        Ok(BinaryHandle {
            output,
            left,
            right,
        })
    }

    /// Add a fold over `inputs`.
    pub fn insert_fold<F: Fold>(
        &mut self,
        folder: F,
        inputs: impl IntoIterator<Item = Source<F::Input>>,
    ) -> Result<FoldHandle<F::Input, F::Output>> {
        let sources: Vec<Source<F::Input>> = inputs.into_iter().collect();
        let clock = self.prepare_inputs(&sources)?;
        let inputs = self.insert_inputs(sources)?;
        let ids: Vec<NodeId> = inputs.iter().map(|input| input.id()).collect();

        let body = FoldOperation {
            folder,
            inputs: inputs.clone(),
        };
        let output = self.insert_operator::<F::Output>(clock.as_ref(), Box::new(body), &ids)?;
        Ok(FoldHandle { output, inputs })
    }

    /// Append an input to a fold.
    pub fn push_fold_input<F: Fold>(
        &mut self,
        fold: SignalId<F::Output>,
        source: impl Into<Source<F::Input>>,
    ) -> Result<ValueId<F::Input>> {
        let id = fold.id();
        self.fold_body::<F>(id)?;

        let source = source.into();
        let clock = self.prepare_inputs(std::slice::from_ref(&source))?;
        let slot = self.slot(id)?;
        let inputs = slot
            .children
            .iter()
            .map(|child| self.nodes.get(child).and_then(|slot| slot.sink.clock.as_ref()));
        let shared = shared_clock(inputs.chain([clock.as_ref()]))?;
        let plan = self.plan_clock(id, shared.or_else(|| slot.sink.clock.clone()))?;

        let input = self.insert_value(source)?;
        self.adopt(id, input.id())?;
        self.fold_body_mut::<F>(id)?.inputs.push(input);
        self.apply_clock_plan(plan);
        self.slot_mut(id)?.sink.invalidate();
        Ok(input)
    }

    /// Change the number of inputs of a fold.
    ///
    /// Surplus inputs are removed from the end. New inputs are constants
    /// holding [`Fold::default_input`].
    pub fn resize_fold<F: Fold>(&mut self, fold: SignalId<F::Output>, size: usize) -> Result<()> {
        let id = fold.id();
        let body = self.fold_body_mut::<F>(id)?;
        let removed = if size < body.inputs.len() {
            body.inputs.split_off(size)
        } else {
            Vec::new()
        };
        let missing = size.saturating_sub(body.inputs.len());
        let default = body.folder.default_input();

        for input in removed {
            let input = input.id();
            self.slot_mut(id)?.children.retain(|child| *child != input);
            if let Some(slot) = self.nodes.get_mut(&input) {
                slot.owner = None;
            }
            self.destroy(input);
        }
        for _ in 0..missing {
            self.push_fold_input::<F>(fold, Source::Constant(default.clone()))?;
        }

        debug!(fold = %id, size, "fold resized");
        self.slot_mut(id)?.sink.invalidate();
        Ok(())
    }

    /// One of the inputs of a fold.
    pub fn fold_input<F: Fold>(&self, fold: SignalId<F::Output>, index: usize) -> Result<ValueId<F::Input>> {
        let inputs = &self.fold_body::<F>(fold.id())?.inputs;
        inputs.get(index).copied().ok_or(Error::InputOutOfRange {
            node: fold.id(),
            index,
            len: inputs.len(),
        })
    }

    /// Number of inputs of a fold.
    pub fn fold_input_count<F: Fold>(&self, fold: SignalId<F::Output>) -> Result<usize> {
        Ok(self.fold_body::<F>(fold.id())?.inputs.len())
    }

    fn fold_body<F: Fold>(&self, id: NodeId) -> Result<&FoldOperation<F>> {
        self.body_ref::<FoldOperation<F>>(id, type_name::<F>())
    }

    fn fold_body_mut<F: Fold>(&mut self, id: NodeId) -> Result<&mut FoldOperation<F>> {
        self.body_mut::<FoldOperation<F>>(id, type_name::<F>())
    }

    /// Validate operator inputs and find the clock they share.
    fn prepare_inputs<T: 'static>(&self, sources: &[Source<T>]) -> Result<Option<Arc<Clock>>> {
        let mut clocks = Vec::with_capacity(sources.len());
        let mut owned = Vec::new();
        for source in sources {
            if let Source::Internal(signal) = source {
                if owned.contains(&signal.id()) {
                    return Err(Error::AlreadyOwned(signal.id()));
                }
                owned.push(signal.id());
            }
            clocks.push(self.validate_source(source, None)?);
        }
        shared_clock(clocks.iter().map(Option::as_ref))
    }

    fn insert_inputs<T>(&mut self, sources: Vec<Source<T>>) -> Result<Vec<ValueId<T>>>
    where
        T: Clone + Default + Send + 'static,
    {
        let mut inputs = Vec::with_capacity(sources.len());
        for source in sources {
            match self.insert_value(source) {
                Ok(input) => inputs.push(input),
                Err(error) => {
                    for input in inputs {
                        self.destroy(input.id());
                    }
                    return Err(error);
                }
            }
        }
        Ok(inputs)
    }

    fn insert_operator<Out: Clone + Default + Send + 'static>(
        &mut self,
        clock: Option<&Arc<Clock>>,
        body: Box<dyn NodeBody>,
        inputs: &[NodeId],
    ) -> Result<SignalId<Out>> {
        let slot = Slot::new(NodeKind::Signal, clock, body).with_cache(Out::default());
        let id = self.insert_slot(slot);
        for input in inputs {
            self.adopt(id, *input)?;
        }
        Ok(SignalId::from_node(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::Signal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    impl Signal for Counter {
        type Output = i32;

        fn generate_sample(&mut self, _cx: &mut Context<'_>, out: &mut i32) -> Result<()> {
            *out = self.0.fetch_add(1, Ordering::SeqCst) as i32 + 1;
            Ok(())
        }
    }

    struct Product;

    impl Fold for Product {
        type Input = i32;
        type Output = i32;

        fn init(&self) -> i32 {
            1
        }

        fn fold(&self, acc: i32, input: &i32) -> i32 {
            acc * input
        }

        fn default_input(&self) -> i32 {
            1
        }
    }

    /// Wraps negative samples into the positive range.
    struct Absolute;

    impl Convert<i32, u32> for Absolute {
        fn convert_sample(&mut self, input: &i32, out: &mut u32) {
            *out = input.unsigned_abs();
        }
    }

    #[test]
    fn binary_operation_combines_its_inputs() {
        let clock = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let x = graph.insert_signal(Some(&clock), Counter(runs.clone()));

        let sum = graph
            .insert_binary(|a: &i32, b: &i32| a + b, x, Source::Constant(10))
            .unwrap();
        assert!(Arc::ptr_eq(&graph.clock(sum.output).unwrap().unwrap(), &clock));
        assert_eq!(graph.pull(sum.output).unwrap(), 11);
        assert_eq!(graph.pull(sum.output).unwrap(), 11);

        clock.tick(&mut graph).unwrap();
        assert_eq!(graph.pull(sum.output).unwrap(), 12);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        graph.set_constant(sum.right, 100).unwrap();
        assert_eq!(graph.pull(sum.output).unwrap(), 102);
    }

    #[test]
    fn unary_operation_converts_types() {
        let mut graph = Graph::new();
        let abs: UnaryHandle<i32, u32> = graph.insert_unary(Absolute, Source::Constant(-4)).unwrap();
        assert_eq!(graph.pull(abs.output).unwrap(), 4_u32);
        assert!(graph.clock(abs.output).unwrap().is_none());
    }

    #[test]
    fn inputs_on_different_clocks_are_rejected() {
        let audio = Clock::invariable(44100.0);
        let video = Clock::invariable(60.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        let b = graph.insert_signal(Some(&video), Counter(Arc::default()));
        let before = graph.node_count();

        let result = graph.insert_binary(|a: &i32, b: &i32| a * b, a, b);
        assert_eq!(
            result.unwrap_err(),
            Error::ClockMismatch {
                left: audio.id(),
                right: video.id(),
            }
        );
        assert_eq!(graph.node_count(), before);
        assert!(graph.dependents(a).unwrap().is_empty());
    }

    #[test]
    fn rewiring_an_input_onto_another_clock_is_rejected() {
        let audio = Clock::invariable(44100.0);
        let video = Clock::invariable(60.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        let b = graph.insert_signal(Some(&video), Counter(Arc::default()));

        let sum = graph
            .insert_binary(|a: &i32, b: &i32| a + b, a, Source::Constant(0))
            .unwrap();
        assert!(matches!(
            graph.set_reference(sum.right, b),
            Err(Error::ClockMismatch { .. })
        ));
        assert!(graph.is_constant(sum.right));

        let c = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        graph.set_reference(sum.right, c).unwrap();
    }

    #[test]
    fn unattached_operator_takes_the_clock_of_a_rewired_input() {
        let audio = Clock::invariable(44100.0);
        let video = Clock::invariable(60.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        let b = graph.insert_signal(Some(&video), Counter(Arc::default()));

        let combines = Arc::new(AtomicUsize::new(0));
        let counted = combines.clone();
        let sum = graph
            .insert_binary(
                move |a: &i32, b: &i32| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    a + b
                },
                Source::Constant(0),
                Source::Constant(0),
            )
            .unwrap();
        assert!(graph.clock(sum.output).unwrap().is_none());

        graph.set_reference(sum.left, a).unwrap();
        assert!(Arc::ptr_eq(&graph.clock(sum.output).unwrap().unwrap(), &audio));
        assert_eq!(
            graph.set_reference(sum.right, b),
            Err(Error::ClockMismatch {
                left: audio.id(),
                right: video.id(),
            })
        );
        assert!(graph.is_constant(sum.right));

        assert_eq!(graph.pull(sum.output).unwrap(), 1);
        assert_eq!(graph.pull(sum.output).unwrap(), 1);
        assert_eq!(graph.pull(sum.output).unwrap(), 1);
        assert_eq!(combines.load(Ordering::SeqCst), 1);

        audio.tick(&mut graph).unwrap();
        assert_eq!(graph.pull(sum.output).unwrap(), 2);
        assert_eq!(combines.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn operator_clock_cannot_leave_its_inputs() {
        let audio = Clock::invariable(44100.0);
        let video = Clock::invariable(60.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        let sum = graph
            .insert_binary(|a: &i32, b: &i32| a + b, a, Source::Constant(1))
            .unwrap();

        assert_eq!(
            graph.set_clock(sum.output, Some(&video)),
            Err(Error::ClockMismatch {
                left: audio.id(),
                right: video.id(),
            })
        );
        assert_eq!(
            graph.set_clock(sum.output, None),
            Err(Error::ClockFollowsInputs {
                node: sum.output.id(),
                clock: audio.id(),
            })
        );
        assert!(Arc::ptr_eq(&graph.clock(sum.output).unwrap().unwrap(), &audio));
    }

    #[test]
    fn operators_follow_inputs_onto_another_clock() {
        let first = Clock::invariable(10.0);
        let second = Clock::invariable(10.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&first), Counter(Arc::default()));
        let sum = graph
            .insert_binary(|a: &i32, b: &i32| a + b, a, Source::Constant(1))
            .unwrap();

        graph.set_clock(a, Some(&second)).unwrap();
        assert!(Arc::ptr_eq(&graph.clock(sum.left).unwrap().unwrap(), &second));
        assert!(Arc::ptr_eq(&graph.clock(sum.output).unwrap().unwrap(), &second));

        // An operator can't end up with inputs on two clocks.
        let x = graph.insert_signal(Some(&first), Counter(Arc::default()));
        let y = graph.insert_signal(Some(&first), Counter(Arc::default()));
        let pair = graph.insert_binary(|a: &i32, b: &i32| a * b, x, y).unwrap();
        assert_eq!(
            graph.set_clock(x, Some(&second)),
            Err(Error::ClockMismatch {
                left: second.id(),
                right: first.id(),
            })
        );
        assert!(Arc::ptr_eq(&graph.clock(x).unwrap().unwrap(), &first));
        assert!(Arc::ptr_eq(&graph.clock(pair.left).unwrap().unwrap(), &first));
    }

    #[test]
    fn fold_takes_the_clock_of_a_pushed_input() {
        let audio = Clock::invariable(44100.0);
        let video = Clock::invariable(60.0);
        let mut graph = Graph::new();
        let a = graph.insert_signal(Some(&audio), Counter(Arc::default()));
        let b = graph.insert_signal(Some(&video), Counter(Arc::default()));

        let product = graph.insert_fold(Product, [Source::Constant(3)]).unwrap();
        graph.push_fold_input::<Product>(product.output, a).unwrap();
        assert!(Arc::ptr_eq(&graph.clock(product.output).unwrap().unwrap(), &audio));
        assert_eq!(graph.pull(product.output).unwrap(), 3);

        assert!(matches!(
            graph.push_fold_input::<Product>(product.output, b),
            Err(Error::ClockMismatch { .. })
        ));
        assert_eq!(graph.fold_input_count::<Product>(product.output).unwrap(), 2);
    }

    #[test]
    fn operator_owns_its_inputs() {
        let mut graph = Graph::new();
        let kept = graph.insert_signal(None, Counter(Arc::default()));
        let owned = graph.insert_signal(None, Counter(Arc::default()));

        let sum = graph
            .insert_binary(|a: &i32, b: &i32| a + b, kept, Source::Internal(owned))
            .unwrap();
        assert_eq!(graph.owner(sum.left).unwrap(), Some(sum.output.id()));
        assert_eq!(
            graph.remove(sum.left),
            Err(Error::Owned {
                node: sum.left.id(),
                owner: sum.output.id(),
            })
        );

        graph.remove(sum.output).unwrap();
        assert!(!graph.contains(sum.left));
        assert!(!graph.contains(sum.right));
        assert!(!graph.contains(owned));
        assert!(graph.contains(kept));
        assert!(graph.dependents(kept).unwrap().is_empty());
    }

    #[test]
    fn one_signal_cannot_be_owned_twice() {
        let mut graph = Graph::new();
        let x = graph.insert_signal(None, Counter(Arc::default()));
        let result = graph.insert_binary(|a: &i32, b: &i32| a + b, Source::Internal(x), Source::Internal(x));
        assert_eq!(result.unwrap_err(), Error::AlreadyOwned(x.id()));
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.owner(x).unwrap(), None);
    }

    #[test]
    fn fold_accumulates_and_resizes() {
        let mut graph = Graph::new();
        let product = graph
            .insert_fold(Product, [Source::Constant(2), Source::Constant(3)])
            .unwrap();
        assert_eq!(graph.pull(product.output).unwrap(), 6);

        graph.resize_fold::<Product>(product.output, 4).unwrap();
        assert_eq!(graph.fold_input_count::<Product>(product.output).unwrap(), 4);
        assert_eq!(graph.pull(product.output).unwrap(), 6);

        let last = graph.fold_input::<Product>(product.output, 3).unwrap();
        assert_eq!(*graph.constant(last).unwrap(), 1);
        graph.set_constant(last, 2).unwrap();
        assert_eq!(graph.pull(product.output).unwrap(), 12);

        graph.resize_fold::<Product>(product.output, 1).unwrap();
        assert!(!graph.contains(last));
        assert_eq!(graph.pull(product.output).unwrap(), 2);
        assert_eq!(
            graph.fold_input::<Product>(product.output, 1),
            Err(Error::InputOutOfRange {
                node: product.output.id(),
                index: 1,
                len: 1,
            })
        );
    }

    #[test]
    fn empty_fold_outputs_default() {
        let mut graph = Graph::new();
        let product = graph.insert_fold(Product, Vec::new()).unwrap();
        assert_eq!(graph.pull(product.output).unwrap(), 0);

        graph.push_fold_input::<Product>(product.output, Source::Constant(5)).unwrap();
        assert_eq!(graph.pull(product.output).unwrap(), 5);
    }
}
