// kernel.rs — Kernel data model
//
// The kernel is a value: passes take `&Kernel` and build a modified copy.
// Instructions, temporaries and the iteration domain are exclusively owned
// by the kernel; nothing outside it holds mutable access.
//
// Preconditions: every iname mentioned by an instruction is a domain
//   dimension with exactly one entry in `iname_to_tag`.
// Postconditions: none (data types and queries).
// Failure modes: trip-count queries on non-constant extents return E0703.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::diag::{codes, Diagnostic, Subject};
use crate::domain::BasicSet;
use crate::expr::Expr;
use crate::names::first_free;
use crate::schedule::ScheduleItem;

// ── Data types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Int32,
    Int64,
    Float32,
    Float64,
}

impl Dtype {
    pub fn from_name(name: &str) -> Option<Dtype> {
        match name {
            "int32" => Some(Dtype::Int32),
            "int64" => Some(Dtype::Int64),
            "float32" => Some(Dtype::Float32),
            "float64" => Some(Dtype::Float64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }

    pub fn itemsize(self) -> u64 {
        match self {
            Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64)
    }

    pub fn int_min(self) -> i64 {
        match self {
            Dtype::Int32 => i64::from(i32::MIN),
            _ => i64::MIN,
        }
    }

    pub fn int_max(self) -> i64 {
        match self {
            Dtype::Int32 => i64::from(i32::MAX),
            _ => i64::MAX,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Iname tags ──────────────────────────────────────────────────────────────

/// How a loop index is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexTag {
    Sequential,
    Unroll,
    Ilp,
    Vectorize,
    GroupAxis(usize),
    LocalAxis(usize),
    /// A local axis to be chosen by the axis assigner.
    AutoLocalAxis,
}

impl IndexTag {
    pub fn parse(text: &str) -> Option<IndexTag> {
        match text {
            "seq" => Some(IndexTag::Sequential),
            "unr" => Some(IndexTag::Unroll),
            "ilp" => Some(IndexTag::Ilp),
            "vec" => Some(IndexTag::Vectorize),
            "l.auto" => Some(IndexTag::AutoLocalAxis),
            _ => {
                let (kind, axis) = text.split_once('.')?;
                let axis: usize = axis.parse().ok()?;
                match kind {
                    "l" => Some(IndexTag::LocalAxis(axis)),
                    "g" => Some(IndexTag::GroupAxis(axis)),
                    _ => None,
                }
            }
        }
    }

    /// Explicit or automatic local axis.
    pub fn is_local(self) -> bool {
        matches!(self, IndexTag::LocalAxis(_) | IndexTag::AutoLocalAxis)
    }

    pub fn is_auto(self) -> bool {
        self == IndexTag::AutoLocalAxis
    }

    /// Tags whose iterations may run concurrently.
    pub fn is_concurrent(self) -> bool {
        !matches!(self, IndexTag::Sequential | IndexTag::Unroll)
    }
}

impl fmt::Display for IndexTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexTag::Sequential => write!(f, "seq"),
            IndexTag::Unroll => write!(f, "unr"),
            IndexTag::Ilp => write!(f, "ilp"),
            IndexTag::Vectorize => write!(f, "vec"),
            IndexTag::GroupAxis(n) => write!(f, "g.{}", n),
            IndexTag::LocalAxis(n) => write!(f, "l.{}", n),
            IndexTag::AutoLocalAxis => write!(f, "l.auto"),
        }
    }
}

// ── Arguments and temporaries ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KernelArg {
    /// Row-major array in global memory.
    Global {
        name: String,
        dtype: Dtype,
        shape: Vec<Expr>,
    },
    Image {
        name: String,
        dtype: Dtype,
        shape: Vec<Expr>,
    },
    /// Runtime scalar with an approximate value for cost heuristics.
    Scalar {
        name: String,
        dtype: Dtype,
        approximately: i64,
    },
}

impl KernelArg {
    pub fn name(&self) -> &str {
        match self {
            KernelArg::Global { name, .. }
            | KernelArg::Image { name, .. }
            | KernelArg::Scalar { name, .. } => name,
        }
    }

    pub fn dtype(&self) -> Dtype {
        match self {
            KernelArg::Global { dtype, .. }
            | KernelArg::Image { dtype, .. }
            | KernelArg::Scalar { dtype, .. } => *dtype,
        }
    }

    /// Element strides of a global array, innermost stride 1.
    pub fn strides(&self) -> Option<Vec<Expr>> {
        let KernelArg::Global { shape, .. } = self else {
            return None;
        };
        let mut strides = vec![Expr::Int(1); shape.len()];
        for k in (0..shape.len().saturating_sub(1)).rev() {
            strides[k] = match &strides[k + 1] {
                Expr::Int(1) => shape[k + 1].clone(),
                s => Expr::mul(s.clone(), shape[k + 1].clone()),
            };
        }
        Some(strides)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryVariable {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<i64>,
    /// Lives in hardware-local (shared) memory.
    pub is_local: bool,
    /// Physical layout; `None` until the storage adjuster runs.
    pub storage_shape: Option<Vec<i64>>,
}

impl TemporaryVariable {
    pub fn new(name: &str, dtype: Dtype, shape: Vec<i64>) -> Self {
        TemporaryVariable {
            name: name.to_string(),
            dtype,
            shape,
            is_local: false,
            storage_shape: None,
        }
    }

    pub fn effective_storage_shape(&self) -> &[i64] {
        self.storage_shape.as_deref().unwrap_or(&self.shape)
    }

    pub fn nbytes(&self) -> u64 {
        let elems: i64 = self.effective_storage_shape().iter().product();
        self.dtype.itemsize() * elems.max(0) as u64
    }
}

// ── Instructions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: String,
    /// `Var` or `Subscript`.
    pub assignee: Expr,
    pub expression: Expr,
    pub insn_deps: BTreeSet<String>,
    pub forced_iname_deps: BTreeSet<String>,
    /// `None` until dependency inference runs.
    pub boostable: Option<bool>,
    pub boostable_into: Option<BTreeSet<String>>,
}

impl Instruction {
    pub fn new(id: &str, assignee: Expr, expression: Expr) -> Self {
        Instruction {
            id: id.to_string(),
            assignee,
            expression,
            insn_deps: BTreeSet::new(),
            forced_iname_deps: BTreeSet::new(),
            boostable: None,
            boostable_into: None,
        }
    }

    pub fn assignee_var_name(&self) -> &str {
        match &self.assignee {
            Expr::Var(name) | Expr::Tagged { name, .. } => name,
            Expr::Subscript { aggregate, .. } => aggregate,
            _ => "",
        }
    }

    pub fn assignee_indices(&self) -> &[Expr] {
        match &self.assignee {
            Expr::Subscript { index, .. } => index,
            _ => &[],
        }
    }

    /// Variables read by the expression or by the assignee's index.
    pub fn read_var_names(&self) -> BTreeSet<String> {
        let mut out = self.expression.dependencies();
        for idx in self.assignee_indices() {
            out.extend(idx.dependencies());
        }
        out
    }
}

// ── Kernel ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kernel {
    pub name: String,
    pub domain: BasicSet,
    pub instructions: Vec<Instruction>,
    pub args: Vec<KernelArg>,
    pub temporary_variables: BTreeMap<String, TemporaryVariable>,
    pub iname_to_tag: BTreeMap<String, IndexTag>,
    pub device: Device,
    pub schedule: Option<Vec<ScheduleItem>>,
}

impl Kernel {
    pub fn all_inames(&self) -> BTreeSet<String> {
        self.domain.dims.iter().cloned().collect()
    }

    pub fn iname_tag(&self, iname: &str) -> IndexTag {
        self.iname_to_tag
            .get(iname)
            .copied()
            .unwrap_or(IndexTag::Sequential)
    }

    pub fn insn(&self, id: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    pub fn arg(&self, name: &str) -> Option<&KernelArg> {
        self.args.iter().find(|a| a.name() == name)
    }

    /// Inames an instruction runs under: forced ones plus those its
    /// expression or assignee depends on.
    pub fn insn_inames(&self, insn: &Instruction) -> BTreeSet<String> {
        let mut out = insn.forced_iname_deps.clone();
        let mut deps = insn.expression.dependencies();
        deps.extend(insn.assignee.dependencies());
        out.extend(deps.into_iter().filter(|d| self.domain.has_dim(d)));
        out
    }

    /// Variable name → ids of the instructions assigning to it.
    pub fn find_writers(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut writers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for insn in &self.instructions {
            writers
                .entry(insn.assignee_var_name().to_string())
                .or_default()
                .insert(insn.id.clone());
        }
        writers
    }

    /// Every name in use: arguments, temporaries, inames and parameters.
    pub fn all_variable_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.args.iter().map(|a| a.name().to_string()).collect();
        names.extend(self.temporary_variables.keys().cloned());
        names.extend(self.domain.dims.iter().cloned());
        names.extend(self.domain.params());
        names
    }

    pub fn make_unique_var_name(&self, base: &str, extra_used: &BTreeSet<String>) -> String {
        let used = self.all_variable_names();
        first_free(base, |n| used.contains(n) || extra_used.contains(n))
    }

    pub fn make_unique_instruction_id(&self, base: &str, extra_used: &BTreeSet<String>) -> String {
        first_free(base, |n| self.insn(n).is_some() || extra_used.contains(n))
    }

    /// Trip count of `iname` as a compile-time constant.
    pub fn constant_iname_length(&self, iname: &str) -> Result<i64, Diagnostic> {
        if !self.domain.has_dim(iname) {
            return Err(Diagnostic::error(
                codes::E0706,
                Subject::Iname(iname.to_string()),
                "not a dimension of the kernel domain",
            ));
        }
        self.domain.static_size(iname).map_err(|e| {
            Diagnostic::error(
                codes::E0703,
                Subject::Iname(iname.to_string()),
                format!("trip count is not a compile-time constant: {}", e),
            )
            .with_hint("bound the iname by constants, or split it first")
        })
    }

    /// Lengths of the explicitly assigned local axes. Axes that no iname
    /// is tagged to have length 1.
    pub fn local_axis_lengths(&self) -> Result<Vec<i64>, Diagnostic> {
        let mut sizes: Vec<i64> = Vec::new();
        for (iname, tag) in &self.iname_to_tag {
            if let IndexTag::LocalAxis(axis) = tag {
                let length = self.constant_iname_length(iname)?;
                if sizes.len() <= *axis {
                    sizes.resize(axis + 1, 1);
                }
                sizes[*axis] = sizes[*axis].max(length);
            }
        }
        Ok(sizes)
    }

    /// Approximate values of scalar arguments, for cost heuristics.
    pub fn approximate_values(&self) -> HashMap<String, i64> {
        self.args
            .iter()
            .filter_map(|a| match a {
                KernelArg::Scalar {
                    name,
                    approximately,
                    ..
                } => Some((name.clone(), *approximately)),
                _ => None,
            })
            .collect()
    }

    /// Total bytes of all local temporaries, using their storage shapes.
    pub fn local_mem_bytes(&self) -> u64 {
        self.temporary_variables
            .values()
            .filter(|t| t.is_local)
            .map(TemporaryVariable::nbytes)
            .sum()
    }
}

fn write_shape<T: fmt::Display>(f: &mut fmt::Formatter<'_>, shape: &[T]) -> fmt::Result {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    write!(f, "[{}]", dims.join(", "))
}

fn join_set(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {}", self.name)?;
        writeln!(f, "domain {}", self.domain)?;
        for arg in &self.args {
            match arg {
                KernelArg::Global { name, dtype, shape } => {
                    write!(f, "arg global {} {}", dtype, name)?;
                    write_shape(f, shape)?;
                }
                KernelArg::Image { name, dtype, shape } => {
                    write!(f, "arg image {} {}", dtype, name)?;
                    write_shape(f, shape)?;
                }
                KernelArg::Scalar {
                    name,
                    dtype,
                    approximately,
                } => write!(f, "arg scalar {} {} ~ {}", dtype, name, approximately)?,
            }
            writeln!(f)?;
        }
        for temp in self.temporary_variables.values() {
            write!(f, "temp {} {}", temp.dtype, temp.name)?;
            write_shape(f, &temp.shape)?;
            write!(f, " {}", if temp.is_local { "local" } else { "private" })?;
            if let Some(storage) = &temp.storage_shape {
                write!(f, " storage")?;
                write_shape(f, storage)?;
            }
            writeln!(f)?;
        }
        if !self.iname_to_tag.is_empty() {
            let tags: Vec<String> = self
                .iname_to_tag
                .iter()
                .map(|(i, t)| format!("{} = {}", i, t))
                .collect();
            writeln!(f, "tag {}", tags.join(", "))?;
        }
        for insn in &self.instructions {
            write!(f, "insn {}: {} = {}", insn.id, insn.assignee, insn.expression)?;
            if !insn.insn_deps.is_empty() {
                write!(f, " deps({})", join_set(&insn.insn_deps))?;
            }
            if !insn.forced_iname_deps.is_empty() {
                write!(f, " inames({})", join_set(&insn.forced_iname_deps))?;
            }
            match (insn.boostable, &insn.boostable_into) {
                (Some(true), Some(into)) => write!(f, " boostable({})", join_set(into))?,
                (Some(true), None) => write!(f, " boostable")?,
                (Some(false), _) => write!(f, " fixed")?,
                (None, _) => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AffineExpr, Constraint};

    fn small_kernel() -> Kernel {
        let v = AffineExpr::var;
        let domain = BasicSet::universe(vec!["i".to_string(), "j".to_string()])
            .with_constraint(Constraint::ge(&v("i"), &AffineExpr::constant(0)))
            .with_constraint(Constraint::lt(&v("i"), &v("n")))
            .with_constraint(Constraint::ge(&v("j"), &AffineExpr::constant(0)))
            .with_constraint(Constraint::lt(&v("j"), &AffineExpr::constant(16)));
        let insn = Instruction::new(
            "insn",
            Expr::subscript("out", vec![Expr::var("i")]),
            Expr::subscript("a", vec![Expr::var("i"), Expr::var("j")]),
        );
        Kernel {
            name: "k".to_string(),
            domain,
            instructions: vec![insn],
            args: vec![
                KernelArg::Global {
                    name: "a".to_string(),
                    dtype: Dtype::Float32,
                    shape: vec![Expr::var("n"), Expr::Int(16)],
                },
                KernelArg::Scalar {
                    name: "n".to_string(),
                    dtype: Dtype::Int32,
                    approximately: 1000,
                },
            ],
            temporary_variables: BTreeMap::new(),
            iname_to_tag: BTreeMap::from([
                ("i".to_string(), IndexTag::AutoLocalAxis),
                ("j".to_string(), IndexTag::LocalAxis(0)),
            ]),
            device: Device::nvidia_fermi(),
            schedule: None,
        }
    }

    #[test]
    fn tag_parsing() {
        assert_eq!(IndexTag::parse("l.auto"), Some(IndexTag::AutoLocalAxis));
        assert_eq!(IndexTag::parse("g.2"), Some(IndexTag::GroupAxis(2)));
        assert_eq!(IndexTag::parse("l.1"), Some(IndexTag::LocalAxis(1)));
        assert_eq!(IndexTag::parse("x.1"), None);
        assert_eq!(IndexTag::parse("ilp"), Some(IndexTag::Ilp));
    }

    #[test]
    fn insn_inames_from_expression_and_assignee() {
        let k = small_kernel();
        let inames: Vec<String> = k.insn_inames(&k.instructions[0]).into_iter().collect();
        assert_eq!(inames, vec!["i", "j"]);
    }

    #[test]
    fn unique_names_avoid_every_kernel_name() {
        let k = small_kernel();
        assert_eq!(k.make_unique_var_name("acc", &BTreeSet::new()), "acc");
        assert_eq!(k.make_unique_var_name("n", &BTreeSet::new()), "n_0");
        let extra = BTreeSet::from(["insn_0".to_string()]);
        assert_eq!(k.make_unique_instruction_id("insn", &extra), "insn_1");
    }

    #[test]
    fn constant_lengths_and_local_sizes() {
        let k = small_kernel();
        assert_eq!(k.constant_iname_length("j").unwrap(), 16);
        let err = k.constant_iname_length("i").unwrap_err();
        assert_eq!(err.code, Some(codes::E0703));
        assert_eq!(k.local_axis_lengths().unwrap(), vec![16]);
    }

    #[test]
    fn strides_are_row_major() {
        let k = small_kernel();
        let strides = k.arg("a").unwrap().strides().unwrap();
        assert_eq!(strides, vec![Expr::Int(16), Expr::Int(1)]);
    }
}
