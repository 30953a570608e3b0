//! Selection of the variables handed to the optimizer.
use candle::Var;
use candle_nn::VarMap;

/// The variables of a [`VarMap`] split into a trainable and a frozen set, both sorted by name.
#[derive(Clone, Default)]
pub struct VarPartition {
    pub trainable: Vec<(String, Var)>,
    pub frozen: Vec<(String, Var)>,
}

impl VarPartition {
    /// Splits the variables using `is_frozen`, evaluated once per variable name.
    pub fn from_predicate<F: Fn(&str) -> bool>(varmap: &VarMap, is_frozen: F) -> Self {
        let mut vars = {
            let data = varmap.data().lock().unwrap();
            data.iter()
                .map(|(name, var)| (name.clone(), var.clone()))
                .collect::<Vec<_>>()
        };
        vars.sort_by(|(a, _), (b, _)| a.cmp(b));
        let (frozen, trainable): (Vec<_>, Vec<_>) =
            vars.into_iter().partition(|(name, _)| is_frozen(name));
        Self { trainable, frozen }
    }

    /// Freezes every variable whose name contains one of `patterns`.
    pub fn from_patterns<S: AsRef<str>>(varmap: &VarMap, patterns: &[S]) -> Self {
        let partition = Self::from_predicate(varmap, |name| {
            patterns.iter().any(|pattern| name.contains(pattern.as_ref()))
        });
        tracing::info!(
            trainable = partition.trainable.len(),
            frozen = partition.frozen.len(),
            "partitioned variables"
        );
        for (name, _) in partition.frozen.iter() {
            tracing::debug!("frozen: {name}");
        }
        partition
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.trainable.iter().map(|(_, var)| var.clone()).collect()
    }

    pub fn trainable_names(&self) -> Vec<&str> {
        self.trainable.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn frozen_names(&self) -> Vec<&str> {
        self.frozen.iter().map(|(name, _)| name.as_str()).collect()
    }
}
