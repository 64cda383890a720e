//! Test doubles shared by the distributed unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use numr::autograd::Var;
use numr::dtype::DType;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::runtime::{Communicator, ReduceOp};
use numr::tensor::{Tensor, TensorId};

use crate::distributed::dispatch::{StepKind, StepModule};
use crate::distributed::payload::{StepPayload, StepResult, Value};
use crate::distributed::placement::{DeviceId, DevicePlacement, HostPlacement};
use crate::distributed::reducer::Reducer;
use crate::error::{Error, Result};
use crate::test_utils::cpu_setup;

/// CPU placement that counts how often it relocates and concatenates.
pub(crate) struct CountingPlacement {
    inner: HostPlacement<CpuClient>,
    relocations: AtomicUsize,
    concats: AtomicUsize,
}

impl CountingPlacement {
    pub(crate) fn new() -> Self {
        let (client, _device) = cpu_setup();
        Self {
            inner: HostPlacement::new(client),
            relocations: AtomicUsize::new(0),
            concats: AtomicUsize::new(0),
        }
    }

    pub(crate) fn relocations(&self) -> usize {
        self.relocations.load(Ordering::SeqCst)
    }

    pub(crate) fn concats(&self) -> usize {
        self.concats.load(Ordering::SeqCst)
    }
}

impl DevicePlacement<CpuRuntime> for CountingPlacement {
    fn to_device(&self, tensor: &Tensor<CpuRuntime>, device: DeviceId) -> Result<Tensor<CpuRuntime>> {
        self.relocations.fetch_add(1, Ordering::SeqCst);
        self.inner.to_device(tensor, device)
    }

    fn var_to_device(&self, var: &Var<CpuRuntime>, device: DeviceId) -> Result<Var<CpuRuntime>> {
        self.relocations.fetch_add(1, Ordering::SeqCst);
        self.inner.var_to_device(var, device)
    }

    fn concat(
        &self,
        parts: &[&Tensor<CpuRuntime>],
        dim: usize,
        device: DeviceId,
    ) -> Result<Tensor<CpuRuntime>> {
        self.concats.fetch_add(1, Ordering::SeqCst);
        self.inner.concat(parts, dim, device)
    }

    fn concat_vars(
        &self,
        parts: &[&Var<CpuRuntime>],
        dim: usize,
        device: DeviceId,
    ) -> Result<Var<CpuRuntime>> {
        self.concats.fetch_add(1, Ordering::SeqCst);
        self.inner.concat_vars(parts, dim, device)
    }
}

/// Identity module: every step returns its payload as
/// `{"args": [...], "kwargs": {...}}`.
pub(crate) struct EchoModule {
    unsupported: HashSet<StepKind>,
    calls: Vec<StepKind>,
    seen_x: Vec<Vec<f32>>,
}

impl EchoModule {
    pub(crate) fn new() -> Self {
        Self {
            unsupported: HashSet::new(),
            calls: Vec::new(),
            seen_x: Vec::new(),
        }
    }

    pub(crate) fn without(mut self, kind: StepKind) -> Self {
        self.unsupported.insert(kind);
        self
    }

    pub(crate) fn calls(&self) -> Vec<StepKind> {
        self.calls.clone()
    }

    /// Contents of the `x` kwarg seen by each call.
    pub(crate) fn seen_x(&self) -> Vec<Vec<f32>> {
        self.seen_x.clone()
    }

    fn echo(&mut self, kind: StepKind, payload: StepPayload<CpuRuntime>) -> StepResult<CpuRuntime> {
        self.calls.push(kind);
        if let Some(x) = payload.kwarg("x").and_then(Value::as_tensor) {
            self.seen_x.push(x.to_vec::<f32>());
        }
        payload.into_value()
    }
}

impl StepModule<CpuRuntime> for EchoModule {
    fn supports(&self, kind: StepKind) -> bool {
        !self.unsupported.contains(&kind)
    }

    fn train_step(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        Ok(self.echo(StepKind::Train, payload))
    }

    fn val_step(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        Ok(self.echo(StepKind::Val, payload))
    }

    fn forward(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        Ok(self.echo(StepKind::Forward, payload))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Ok,
    Erroring,
    Panicking,
}

/// Module whose `train_step` succeeds, returns an error, or panics.
pub(crate) struct FailingModule {
    mode: FailureMode,
    ran: bool,
}

impl FailingModule {
    pub(crate) fn ok() -> Self {
        Self {
            mode: FailureMode::Ok,
            ran: false,
        }
    }

    pub(crate) fn erroring() -> Self {
        Self {
            mode: FailureMode::Erroring,
            ran: false,
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            mode: FailureMode::Panicking,
            ran: false,
        }
    }

    pub(crate) fn ran(&self) -> bool {
        self.ran
    }
}

impl StepModule<CpuRuntime> for FailingModule {
    fn supports(&self, kind: StepKind) -> bool {
        kind == StepKind::Train
    }

    fn train_step(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        self.ran = true;
        match self.mode {
            FailureMode::Ok => Ok(payload.into_value()),
            FailureMode::Erroring => Err(Error::Sharding {
                reason: "loss went NaN".to_string(),
            }),
            FailureMode::Panicking => panic!("replica blew up"),
        }
    }
}

/// Module with one named buffer, `running_mean` unless renamed.
///
/// Train steps add one to every element of the buffer so replicas drift
/// apart unless buffers are pushed from the authority. Loads reject any
/// buffer name other than its own.
pub(crate) struct BufferModule {
    name: String,
    running_mean: Tensor<CpuRuntime>,
    loads: usize,
    steps: usize,
}

impl BufferModule {
    pub(crate) fn new(values: &[f32]) -> Self {
        Self::named("running_mean", values)
    }

    pub(crate) fn named(name: &str, values: &[f32]) -> Self {
        let (_client, device) = cpu_setup();
        Self {
            name: name.to_string(),
            running_mean: Tensor::<CpuRuntime>::from_slice(values, &[values.len()], &device).unwrap(),
            loads: 0,
            steps: 0,
        }
    }

    pub(crate) fn running_mean(&self) -> Vec<f32> {
        self.running_mean.to_vec::<f32>()
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads
    }

    /// Train and val steps run so far.
    pub(crate) fn steps(&self) -> usize {
        self.steps
    }
}

impl StepModule<CpuRuntime> for BufferModule {
    fn supports(&self, kind: StepKind) -> bool {
        kind != StepKind::Forward
    }

    fn train_step(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        self.steps += 1;
        let (_client, device) = cpu_setup();
        let bumped: Vec<f32> = self.running_mean().iter().map(|v| v + 1.0).collect();
        self.running_mean = Tensor::<CpuRuntime>::from_slice(&bumped, &[bumped.len()], &device).unwrap();
        Ok(payload.into_value())
    }

    fn val_step(&mut self, payload: StepPayload<CpuRuntime>) -> Result<StepResult<CpuRuntime>> {
        self.steps += 1;
        Ok(payload.into_value())
    }

    fn named_buffers(&self) -> Vec<(String, Tensor<CpuRuntime>)> {
        vec![(self.name.clone(), self.running_mean.clone())]
    }

    fn load_buffers(&mut self, buffers: Vec<(String, Tensor<CpuRuntime>)>) -> Result<()> {
        for (name, tensor) in buffers {
            if name != self.name {
                return Err(Error::BufferSync {
                    reason: format!("unknown buffer '{name}'"),
                });
            }
            self.running_mean = tensor;
        }
        self.loads += 1;
        Ok(())
    }
}

/// Communicator for a pretend multi-process run: collectives succeed
/// without moving data and are counted.
pub(crate) struct CountingCommunicator {
    world_size: usize,
    broadcasts: AtomicUsize,
    syncs: AtomicUsize,
}

impl CountingCommunicator {
    pub(crate) fn new(world_size: usize) -> Self {
        Self {
            world_size,
            broadcasts: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
        }
    }

    pub(crate) fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub(crate) fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl Communicator for CountingCommunicator {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        0
    }

    unsafe fn all_reduce(
        &self,
        _ptr: u64,
        _count: usize,
        _dtype: DType,
        _op: ReduceOp,
    ) -> numr::error::Result<()> {
        Ok(())
    }

    unsafe fn broadcast(
        &self,
        _ptr: u64,
        _count: usize,
        _dtype: DType,
        _root: usize,
    ) -> numr::error::Result<()> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    unsafe fn all_gather(
        &self,
        _send_ptr: u64,
        _recv_ptr: u64,
        _count: usize,
        _dtype: DType,
    ) -> numr::error::Result<()> {
        Ok(())
    }

    unsafe fn reduce_scatter(
        &self,
        _send_ptr: u64,
        _recv_ptr: u64,
        _count: usize,
        _dtype: DType,
        _op: ReduceOp,
    ) -> numr::error::Result<()> {
        Ok(())
    }

    unsafe fn send(
        &self,
        _ptr: u64,
        _count: usize,
        _dtype: DType,
        _dest: usize,
        _tag: u32,
    ) -> numr::error::Result<()> {
        Ok(())
    }

    unsafe fn recv(
        &self,
        _ptr: u64,
        _count: usize,
        _dtype: DType,
        _src: usize,
        _tag: u32,
    ) -> numr::error::Result<()> {
        Ok(())
    }

    fn sync(&self) -> numr::error::Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn barrier(&self) -> numr::error::Result<()> {
        Ok(())
    }
}

/// Calls observed by a [`RecordingReducer`].
#[derive(Default)]
struct ReducerCalls {
    rebuilds: usize,
    prepared: Vec<Vec<TensorId>>,
}

/// Shared view of a [`RecordingReducer`]'s calls, usable after the
/// reducer has been boxed into a wrapper.
#[derive(Clone)]
pub(crate) struct ReducerLog(Arc<Mutex<ReducerCalls>>);

impl ReducerLog {
    pub(crate) fn rebuilds(&self) -> usize {
        self.0.lock().map(|c| c.rebuilds).unwrap_or(0)
    }

    pub(crate) fn prepared(&self) -> Vec<Vec<TensorId>> {
        self.0.lock().map(|c| c.prepared.clone()).unwrap_or_default()
    }
}

/// Reducer with scripted answers that records every call.
pub(crate) struct RecordingReducer {
    log: ReducerLog,
    rebuild: bool,
    pre_forward: bool,
    post_forward: bool,
    fail_prepare: bool,
}

impl RecordingReducer {
    pub(crate) fn new() -> Self {
        Self {
            log: ReducerLog(Arc::new(Mutex::new(ReducerCalls::default()))),
            rebuild: false,
            pre_forward: false,
            post_forward: false,
            fail_prepare: false,
        }
    }

    pub(crate) fn rebuilding(mut self) -> Self {
        self.rebuild = true;
        self
    }

    pub(crate) fn with_buffer_sync(mut self, pre_forward: bool, post_forward: bool) -> Self {
        self.pre_forward = pre_forward;
        self.post_forward = post_forward;
        self
    }

    pub(crate) fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub(crate) fn log(&self) -> ReducerLog {
        self.log.clone()
    }
}

impl Reducer for RecordingReducer {
    fn rebuild_buckets(&mut self) -> bool {
        if let Ok(mut calls) = self.log.0.lock() {
            calls.rebuilds += 1;
        }
        self.rebuild
    }

    fn should_sync_buffers_pre_forward(&self) -> bool {
        self.pre_forward
    }

    fn should_sync_buffers_post_forward(&self) -> bool {
        self.post_forward
    }

    fn prepare_for_backward(&mut self, outputs: &[TensorId]) -> Result<()> {
        if self.fail_prepare {
            return Err(Error::Reducer {
                reason: "bucket assignment failed".to_string(),
            });
        }
        if let Ok(mut calls) = self.log.0.lock() {
            calls.prepared.push(outputs.to_vec());
        }
        Ok(())
    }
}
