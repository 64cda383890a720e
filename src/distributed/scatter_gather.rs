//! Payload distributor: scatter step inputs across devices, gather results back
//!
//! Tensors and variables are split evenly along the scatter dim, containers
//! are scattered element-wise, literals are replicated and
//! [`Value::Partitioned`] data is handed out one element per device.
//! Gathering reverses this onto the output device.

use std::collections::BTreeMap;

use numr::autograd::{Var, var_narrow, var_reshape};
use numr::dtype::DType;
use numr::ops::{ShapeOps, TensorOps};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

use crate::distributed::payload::{StepPayload, Value};
use crate::distributed::placement::{DeviceId, DevicePlacement};
use crate::error::{Error, Result};

/// How non-batched literals from several devices collapse into one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralMergePolicy {
    /// Keep the first device's value.
    #[default]
    FirstWins,
    /// Keep every device's value, in device order, as a `Seq`.
    Collect,
}

/// Split a tensor evenly into `world_size` chunks along `dim`.
fn split_tensor<R: Runtime>(
    tensor: &Tensor<R>,
    dim: usize,
    world_size: usize,
) -> Result<Vec<Tensor<R>>> {
    let shard_size = shard_size(tensor.shape(), dim, world_size)?;
    (0..world_size)
        .map(|rank| {
            tensor
                .narrow(dim as isize, rank * shard_size, shard_size)
                .and_then(|t| t.contiguous())
                .map_err(|e| Error::Sharding {
                    reason: format!("narrow failed for shard {rank}: {e}"),
                })
        })
        .collect()
}

fn split_var<R>(var: &Var<R>, dim: usize, world_size: usize) -> Result<Vec<Var<R>>>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
{
    let shard_size = shard_size(var.tensor().shape(), dim, world_size)?;
    (0..world_size)
        .map(|rank| {
            var_narrow(var, dim as isize, rank * shard_size, shard_size).map_err(|e| {
                Error::Sharding {
                    reason: format!("narrow failed for shard {rank}: {e}"),
                }
            })
        })
        .collect()
}

fn shard_size(shape: &[usize], dim: usize, world_size: usize) -> Result<usize> {
    if dim >= shape.len() {
        return Err(Error::Sharding {
            reason: format!("dim {dim} out of range for {}D tensor", shape.len()),
        });
    }
    let dim_size = shape[dim];
    if dim_size % world_size != 0 {
        return Err(Error::Sharding {
            reason: format!(
                "dim {dim} size ({dim_size}) not divisible by number of devices ({world_size})"
            ),
        });
    }
    Ok(dim_size / world_size)
}

/// Scatter one value across `targets`.
///
/// Returns exactly `targets.len()` values, element `i` resident on
/// `targets[i]`. With a single target the value is only relocated, never
/// split.
///
/// # Errors
///
/// Returns `Sharding` if `targets` is empty, a batched leaf is not evenly
/// divisible along `dim`, or a `Partitioned` value's length differs from
/// the number of targets.
pub fn scatter<R, P>(
    value: Value<R>,
    targets: &[DeviceId],
    dim: usize,
    placement: &P,
) -> Result<Vec<Value<R>>>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
    P: DevicePlacement<R> + ?Sized,
{
    let n = targets.len();
    if n == 0 {
        return Err(Error::Sharding {
            reason: "no target devices to scatter onto".to_string(),
        });
    }

    match value {
        Value::Tensor(t) => {
            if n == 1 {
                return Ok(vec![relocate(Value::Tensor(t), targets[0], placement)?]);
            }
            split_tensor(&t, dim, n)?
                .iter()
                .zip(targets)
                .map(|(chunk, &device)| placement.to_device(chunk, device).map(Value::Tensor))
                .collect()
        }
        Value::Var(v) => {
            if n == 1 {
                return Ok(vec![relocate(Value::Var(v), targets[0], placement)?]);
            }
            split_var(&v, dim, n)?
                .iter()
                .zip(targets)
                .map(|(chunk, &device)| placement.var_to_device(chunk, device).map(Value::Var))
                .collect()
        }
        Value::Partitioned(items) => {
            if items.len() != n {
                return Err(Error::Sharding {
                    reason: format!(
                        "partitioned value has {} parts for {n} devices",
                        items.len()
                    ),
                });
            }
            items
                .into_iter()
                .zip(targets)
                .map(|(item, device)| relocate(item, *device, placement))
                .collect()
        }
        Value::Seq(items) => {
            let mut per_device: Vec<Vec<Value<R>>> =
                (0..n).map(|_| Vec::with_capacity(items.len())).collect();
            for item in items {
                let shards = scatter(item, targets, dim, placement)?;
                for (slot, shard) in per_device.iter_mut().zip(shards) {
                    slot.push(shard);
                }
            }
            Ok(per_device.into_iter().map(Value::Seq).collect())
        }
        Value::Map(map) => {
            let mut per_device: Vec<BTreeMap<String, Value<R>>> =
                (0..n).map(|_| BTreeMap::new()).collect();
            for (key, item) in map {
                let shards = scatter(item, targets, dim, placement)?;
                for (slot, shard) in per_device.iter_mut().zip(shards) {
                    slot.insert(key.clone(), shard);
                }
            }
            Ok(per_device.into_iter().map(Value::Map).collect())
        }
        Value::Opaque(literal) => Ok(vec![Value::Opaque(literal); n]),
    }
}

/// Move a whole value onto one device without splitting it.
fn relocate<R, P>(value: Value<R>, device: DeviceId, placement: &P) -> Result<Value<R>>
where
    R: Runtime<DType = DType>,
    P: DevicePlacement<R> + ?Sized,
{
    let relocate_all = |items: Vec<Value<R>>| {
        items
            .into_iter()
            .map(|item| relocate(item, device, placement))
            .collect::<Result<Vec<_>>>()
    };
    match value {
        Value::Tensor(t) => placement.to_device(&t, device).map(Value::Tensor),
        Value::Var(v) => placement.var_to_device(&v, device).map(Value::Var),
        Value::Seq(items) => relocate_all(items).map(Value::Seq),
        Value::Partitioned(items) => relocate_all(items).map(Value::Partitioned),
        Value::Map(map) => {
            let mut moved = BTreeMap::new();
            for (key, item) in map {
                moved.insert(key, relocate(item, device, placement)?);
            }
            Ok(Value::Map(moved))
        }
        Value::Opaque(literal) => Ok(Value::Opaque(literal)),
    }
}

/// Scatter a step payload into one payload per target device.
///
/// Positional and named arguments are scattered independently. When one of
/// them is empty, the resulting shards get an empty argument list / map so
/// that every device receives a well-formed payload.
pub fn shard<R, P>(
    payload: StepPayload<R>,
    targets: &[DeviceId],
    dim: usize,
    placement: &P,
) -> Result<Vec<StepPayload<R>>>
where
    R: Runtime<DType = DType>,
    R::Client: TensorOps<R> + ShapeOps<R>,
    P: DevicePlacement<R> + ?Sized,
{
    let n = targets.len();
    if n == 0 {
        return Err(Error::Sharding {
            reason: "no target devices to shard onto".to_string(),
        });
    }

    let StepPayload { args, kwargs } = payload;

    let mut arg_shards: Vec<Vec<Value<R>>> = if args.is_empty() {
        Vec::new()
    } else {
        scatter(Value::Seq(args), targets, dim, placement)?
            .into_iter()
            .map(|v| match v {
                Value::Seq(items) => items,
                other => vec![other],
            })
            .collect()
    };
    let mut kwarg_shards: Vec<BTreeMap<String, Value<R>>> = if kwargs.is_empty() {
        Vec::new()
    } else {
        scatter(Value::Map(kwargs), targets, dim, placement)?
            .into_iter()
            .map(|v| match v {
                Value::Map(map) => map,
                _ => BTreeMap::new(),
            })
            .collect()
    };

    arg_shards.resize_with(n, Vec::new);
    kwarg_shards.resize_with(n, BTreeMap::new);

    Ok(arg_shards
        .into_iter()
        .zip(kwarg_shards)
        .map(|(args, kwargs)| StepPayload::from_parts(args, kwargs))
        .collect())
}

/// Gather per-device results into one result on `output_device`.
///
/// Tensors and variables are concatenated along `dim`; rank-0 leaves are
/// first viewed as `[1]` so per-device scalars (e.g. losses) gather into a
/// vector. Containers merge recursively. Literals collapse per `policy`.
///
/// # Errors
///
/// Returns `Sharding` if `results` is empty or the per-device results do not
/// share the same structure.
pub fn merge<R, P>(
    results: Vec<Value<R>>,
    output_device: DeviceId,
    dim: usize,
    policy: LiteralMergePolicy,
    placement: &P,
) -> Result<Value<R>>
where
    R: Runtime<DType = DType>,
    P: DevicePlacement<R> + ?Sized,
{
    match results.len() {
        0 => Err(Error::Sharding {
            reason: "no per-device results to merge".to_string(),
        }),
        1 => {
            let mut results = results;
            let only = results.pop().ok_or_else(|| Error::Sharding {
                reason: "no per-device results to merge".to_string(),
            })?;
            relocate(only, output_device, placement)
        }
        _ => gather(results, output_device, dim, policy, placement),
    }
}

fn gather<R, P>(
    results: Vec<Value<R>>,
    output_device: DeviceId,
    dim: usize,
    policy: LiteralMergePolicy,
    placement: &P,
) -> Result<Value<R>>
where
    R: Runtime<DType = DType>,
    P: DevicePlacement<R> + ?Sized,
{
    let n = results.len();
    let mut rest = results.into_iter();
    let Some(first) = rest.next() else {
        return Err(Error::Sharding {
            reason: "no per-device results to merge".to_string(),
        });
    };

    match first {
        Value::Tensor(first) => {
            let mut parts = Vec::with_capacity(n);
            parts.push(gather_leaf(first, output_device, placement)?);
            for value in rest {
                let Value::Tensor(t) = value else {
                    return Err(mismatch("tensor", &value));
                };
                parts.push(gather_leaf(t, output_device, placement)?);
            }
            let refs: Vec<&Tensor<R>> = parts.iter().collect();
            placement.concat(&refs, dim, output_device).map(Value::Tensor)
        }
        Value::Var(first) => {
            let mut parts = Vec::with_capacity(n);
            parts.push(gather_var_leaf(first, output_device, placement)?);
            for value in rest {
                let Value::Var(v) = value else {
                    return Err(mismatch("var", &value));
                };
                parts.push(gather_var_leaf(v, output_device, placement)?);
            }
            let refs: Vec<&Var<R>> = parts.iter().collect();
            placement.concat_vars(&refs, dim, output_device).map(Value::Var)
        }
        Value::Seq(first) => {
            let len = first.len();
            let mut columns: Vec<Vec<Value<R>>> =
                first.into_iter().map(|item| vec![item]).collect();
            for value in rest {
                let Value::Seq(items) = value else {
                    return Err(mismatch("sequence", &value));
                };
                if items.len() != len {
                    return Err(Error::Sharding {
                        reason: format!(
                            "sequence results differ in length: {len} vs {}",
                            items.len()
                        ),
                    });
                }
                for (column, item) in columns.iter_mut().zip(items) {
                    column.push(item);
                }
            }
            columns
                .into_iter()
                .map(|column| gather(column, output_device, dim, policy, placement))
                .collect::<Result<Vec<_>>>()
                .map(Value::Seq)
        }
        Value::Map(first) => {
            let mut columns: BTreeMap<String, Vec<Value<R>>> =
                first.into_iter().map(|(key, item)| (key, vec![item])).collect();
            for value in rest {
                let Value::Map(map) = value else {
                    return Err(mismatch("map", &value));
                };
                if map.len() != columns.len() || !map.keys().all(|k| columns.contains_key(k)) {
                    return Err(Error::Sharding {
                        reason: format!(
                            "map results differ in keys: {:?} vs {:?}",
                            columns.keys().collect::<Vec<_>>(),
                            map.keys().collect::<Vec<_>>()
                        ),
                    });
                }
                for (key, item) in map {
                    if let Some(column) = columns.get_mut(&key) {
                        column.push(item);
                    }
                }
            }
            let mut merged = BTreeMap::new();
            for (key, column) in columns {
                merged.insert(key, gather(column, output_device, dim, policy, placement)?);
            }
            Ok(Value::Map(merged))
        }
        Value::Partitioned(first) => {
            let mut parts = Vec::with_capacity(first.len() * n);
            parts.extend(first);
            for value in rest {
                let Value::Partitioned(items) = value else {
                    return Err(mismatch("partitioned", &value));
                };
                parts.extend(items);
            }
            relocate(Value::Partitioned(parts), output_device, placement)
        }
        Value::Opaque(first) => {
            let mut literals = Vec::with_capacity(n);
            literals.push(first);
            for value in rest {
                let Value::Opaque(literal) = value else {
                    return Err(mismatch("literal", &value));
                };
                literals.push(literal);
            }
            match policy {
                LiteralMergePolicy::FirstWins => Ok(Value::Opaque(literals.swap_remove(0))),
                LiteralMergePolicy::Collect => {
                    Ok(Value::Seq(literals.into_iter().map(Value::Opaque).collect()))
                }
            }
        }
    }
}

/// Relocate one tensor for concatenation, viewing rank-0 tensors as `[1]`.
fn gather_leaf<R, P>(tensor: Tensor<R>, device: DeviceId, placement: &P) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    P: DevicePlacement<R> + ?Sized,
{
    let tensor = if tensor.shape().is_empty() {
        tensor.reshape(&[1])?
    } else {
        tensor
    };
    placement.to_device(&tensor, device)
}

fn gather_var_leaf<R, P>(var: Var<R>, device: DeviceId, placement: &P) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    P: DevicePlacement<R> + ?Sized,
{
    let var = if var.tensor().shape().is_empty() {
        var_reshape(&var, &[1])?
    } else {
        var
    };
    placement.var_to_device(&var, device)
}

fn mismatch<R: Runtime>(expected: &str, got: &Value<R>) -> Error {
    Error::Sharding {
        reason: format!("per-device results differ in structure: expected {expected}, got {got:?}"),
    }
}
