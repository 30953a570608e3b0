//! One-time initialization of variables from safetensors checkpoints.
use candle::Device;
use candle_nn::VarMap;
use std::path::Path;

/// Outcome of [`init_from_checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restoration {
    /// Variables whose value was overwritten, sorted by name.
    pub restored: Vec<String>,
    /// Variables under the prefix that the checkpoint does not provide, sorted by name.
    pub missing: Vec<String>,
}

/// Overwrites every variable of `varmap` whose name starts with `prefix` with the tensor of the
/// same name from the checkpoint at `path`.
///
/// Variables absent from the checkpoint keep their current value. A tensor whose shape differs
/// from the variable it maps to is an error.
pub fn init_from_checkpoint<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    prefix: &str,
) -> candle::Result<Restoration> {
    let path = path.as_ref();
    let mut checkpoint = candle::safetensors::load(path, &Device::Cpu)?;
    let data = varmap.data().lock().unwrap();
    let mut names = data
        .keys()
        .filter(|name| name.starts_with(prefix))
        .cloned()
        .collect::<Vec<_>>();
    names.sort();

    let mut restoration = Restoration::default();
    for name in names {
        let var = &data[&name];
        match checkpoint.remove(&name) {
            None => restoration.missing.push(name),
            Some(value) => {
                if value.shape() != var.shape() {
                    candle::bail!(
                        "shape mismatch on {name} in {path:?}: {:?} <> {:?}",
                        value.shape(),
                        var.shape()
                    )
                }
                let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
                if let Err(err) = var.set(&value) {
                    candle::bail!("error setting {name} using data from {path:?}: {err}")
                }
                restoration.restored.push(name)
            }
        }
    }
    tracing::info!(
        "restored {} variables under {prefix:?} from {path:?}, {} not in checkpoint",
        restoration.restored.len(),
        restoration.missing.len()
    );
    for name in restoration.missing.iter() {
        tracing::debug!("not restored: {name}");
    }
    Ok(restoration)
}
