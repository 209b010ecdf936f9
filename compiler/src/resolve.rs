// resolve.rs — Name resolution for kernel sources
//
// Walks the parsed AST, checks every name against the kernel's domain,
// arguments, temporaries and instruction ids, lowers expressions into the
// kernel's expression trees, and builds a `Kernel` value.
//
// Preconditions: `source` is a well-formed AST from the parser.
// Postconditions: on success every domain dimension has exactly one tag
//   (untagged ones are sequential) and every instruction has a unique id.
// Failure modes: unknown names, duplicate definitions, non-affine
//   constraints and bad directive values produce `Diagnostic` entries.
//   Resolution continues past errors; no kernel is built if any occurred.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::ast::*;
use crate::device::{Device, LocalMemKind};
use crate::diag::{codes, has_errors, Diagnostic, Subject};
use crate::domain::{AffineExpr, BasicSet, Constraint};
use crate::expr::{Expr, Reduction, ReductionKind, ReductionOp};
use crate::kernel::{Dtype, IndexTag, Instruction, Kernel, KernelArg, TemporaryVariable};
use crate::names::UniqueNameGenerator;
use crate::parser::parse;

// ── Public types ────────────────────────────────────────────────────────────

/// Result of name resolution.
#[derive(Debug)]
pub struct ResolveResult {
    /// `None` if any error-level diagnostic was produced.
    pub kernel: Option<Kernel>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse and resolve a kernel source for `device`.
///
/// `set` directives in the source override facts of a copy of `device`.
pub fn load_kernel(source: &str, device: &Device) -> Result<Kernel, Vec<Diagnostic>> {
    let parsed = parse(source);
    if !parsed.errors.is_empty() {
        return Err(parsed
            .errors
            .iter()
            .map(|e| Diagnostic::error(codes::E0100, Subject::Source(*e.span()), e.to_string()))
            .collect());
    }
    let Some(ast) = parsed.source else {
        return Err(vec![Diagnostic::error(
            codes::E0100,
            Subject::Kernel,
            "source could not be parsed",
        )]);
    };
    let result = resolve(&ast, device);
    match result.kernel {
        Some(kernel) => {
            for d in &result.diagnostics {
                tracing::warn!("{}", d);
            }
            Ok(kernel)
        }
        None => Err(result.diagnostics),
    }
}

/// Resolve a parsed kernel source into a `Kernel`.
pub fn resolve(source: &KernelSource, device: &Device) -> ResolveResult {
    let mut resolver = Resolver {
        device: device.clone(),
        dims: Vec::new(),
        dtypes: HashMap::new(),
        diagnostics: Vec::new(),
    };
    let kernel = resolver.resolve(source);
    let diagnostics = resolver.diagnostics;
    ResolveResult {
        kernel: kernel.filter(|_| !has_errors(&diagnostics)),
        diagnostics,
    }
}

// ── Resolver ────────────────────────────────────────────────────────────────

struct Resolver {
    device: Device,
    dims: Vec<String>,
    /// Declared element type of each argument and temporary.
    dtypes: HashMap<String, Dtype>,
    diagnostics: Vec<Diagnostic>,
}

fn at(span: Span) -> Subject {
    Subject::Source(span)
}

impl Resolver {
    fn error(&mut self, d: Diagnostic) {
        self.diagnostics.push(d);
    }

    fn resolve(&mut self, source: &KernelSource) -> Option<Kernel> {
        let mut name = "kernel".to_string();
        let mut domain_stmts = Vec::new();
        let mut arg_stmts = Vec::new();
        let mut temp_stmts = Vec::new();
        let mut tag_entries: Vec<&TagEntry> = Vec::new();
        let mut insn_stmts = Vec::new();

        for stmt in &source.statements {
            match &stmt.kind {
                StatementKind::Kernel(id) => name = id.name.clone(),
                StatementKind::Set(set) => self.apply_set(set),
                StatementKind::Domain(d) => domain_stmts.push((d, stmt.span)),
                StatementKind::Arg(a) => arg_stmts.push(a),
                StatementKind::Temp(t) => temp_stmts.push(t),
                StatementKind::Tag(entries) => tag_entries.extend(entries),
                StatementKind::Insn(i) => insn_stmts.push((i, stmt.span)),
            }
        }

        let domain = match domain_stmts.as_slice() {
            [] => {
                self.error(
                    Diagnostic::error(codes::E0107, Subject::Kernel, "kernel has no domain")
                        .with_hint("add a line like `domain [i] : 0 <= i < n`"),
                );
                return None;
            }
            [(d, _)] => self.resolve_domain(d),
            [(d, _), rest @ ..] => {
                for (_, span) in rest {
                    self.error(Diagnostic::error(
                        codes::E0107,
                        at(*span),
                        "kernel domain is given more than once",
                    ));
                }
                self.resolve_domain(d)
            }
        };

        let mut taken: BTreeSet<String> = self.dims.iter().cloned().collect();
        let mut args = Vec::new();
        for a in arg_stmts {
            if let Some(arg) = self.resolve_arg(a, &mut taken) {
                args.push(arg);
            }
        }
        let mut temporary_variables = BTreeMap::new();
        for t in temp_stmts {
            if let Some(temp) = self.resolve_temp(t, &mut taken) {
                temporary_variables.insert(temp.name.clone(), temp);
            }
        }

        let mut iname_to_tag = BTreeMap::new();
        for entry in tag_entries {
            if !self.dims.contains(&entry.iname.name) {
                self.error(
                    Diagnostic::error(
                        codes::E0101,
                        Subject::Iname(entry.iname.name.clone()),
                        "tag on a name that is not a domain dimension",
                    )
                    .with_related(at(entry.span), "tagged here"),
                );
                continue;
            }
            iname_to_tag.insert(entry.iname.name.clone(), entry.tag);
        }
        for dim in &self.dims {
            iname_to_tag.entry(dim.clone()).or_insert(IndexTag::Sequential);
        }

        let instructions = self.resolve_instructions(&insn_stmts);

        Some(Kernel {
            name,
            domain,
            instructions,
            args,
            temporary_variables,
            iname_to_tag,
            device: self.device.clone(),
            schedule: None,
        })
    }

    // ── Directives ──

    fn apply_set(&mut self, set: &SetStmt) {
        let applied = match (set.name.name.as_str(), &set.value) {
            ("local_mem", SetValue::Size(bytes, _)) => {
                self.device.local_mem_size = *bytes;
                true
            }
            ("local_mem", SetValue::Int(bytes, _)) => match u64::try_from(*bytes) {
                Ok(bytes) => {
                    self.device.local_mem_size = bytes;
                    true
                }
                Err(_) => false,
            },
            ("banks", SetValue::Int(n, _)) => match u32::try_from(*n) {
                Ok(n) if n > 0 => {
                    self.device.bank_count = n;
                    true
                }
                _ => false,
            },
            ("local_mem_kind", SetValue::Word(word, _)) => {
                let kind = match word.as_str() {
                    "local" => Some(LocalMemKind::Local),
                    "global" => Some(LocalMemKind::Global),
                    "unknown" => Some(LocalMemKind::Unknown),
                    _ => None,
                };
                if let Some(kind) = kind {
                    self.device.local_mem_kind = kind;
                }
                kind.is_some()
            }
            ("local_mem" | "banks" | "local_mem_kind", _) => false,
            (other, _) => {
                self.error(
                    Diagnostic::error(
                        codes::E0106,
                        at(set.name.span),
                        format!("unknown setting '{}'", other),
                    )
                    .with_hint("known settings: local_mem, banks, local_mem_kind"),
                );
                return;
            }
        };
        if !applied {
            self.error(Diagnostic::error(
                codes::E0106,
                at(set.name.span),
                format!("invalid value for setting '{}'", set.name.name),
            ));
        }
    }

    // ── Domain ──

    fn resolve_domain(&mut self, stmt: &DomainStmt) -> BasicSet {
        for dim in &stmt.dims {
            if self.dims.contains(&dim.name) {
                self.error(Diagnostic::error(
                    codes::E0102,
                    at(dim.span),
                    format!("dimension '{}' is listed twice", dim.name),
                ));
                continue;
            }
            self.dims.push(dim.name.clone());
        }
        let mut set = BasicSet::universe(self.dims.clone());
        for chain in &stmt.constraints {
            let mut lhs = self.affine(&chain.first);
            for (op, node) in &chain.rest {
                let rhs = self.affine(node);
                if let (Some(l), Some(r)) = (&lhs, &rhs) {
                    set.add_constraint(match op {
                        CmpOp::Lt => Constraint::lt(l, r),
                        CmpOp::Le => Constraint::le(l, r),
                        CmpOp::Gt => Constraint::gt(l, r),
                        CmpOp::Ge => Constraint::ge(l, r),
                        CmpOp::Eq => Constraint::equals(l, r),
                    });
                }
                lhs = rhs;
            }
        }
        set
    }

    fn affine(&mut self, node: &ExprNode) -> Option<AffineExpr> {
        let affine = self.lower(node, Dtype::Int64).ok().and_then(|e| e.to_affine());
        if affine.is_none() {
            self.error(
                Diagnostic::error(codes::E0103, at(node.span), "domain constraint is not affine")
                    .with_hint("use sums of integer multiples of names and constants"),
            );
        }
        affine
    }

    // ── Variables ──

    fn claim_name(&mut self, name: &Ident, taken: &mut BTreeSet<String>) -> bool {
        if taken.insert(name.name.clone()) {
            return true;
        }
        self.error(Diagnostic::error(
            codes::E0102,
            Subject::Var(name.name.clone()),
            "name is already defined",
        )
        .with_related(at(name.span), "defined again here"));
        false
    }

    fn dtype(&mut self, id: &Ident) -> Option<Dtype> {
        let dtype = Dtype::from_name(&id.name);
        if dtype.is_none() {
            self.error(
                Diagnostic::error(codes::E0109, at(id.span), format!("unknown dtype '{}'", id.name))
                    .with_hint("use int32, int64, float32 or float64"),
            );
        }
        dtype
    }

    fn resolve_arg(&mut self, stmt: &ArgStmt, taken: &mut BTreeSet<String>) -> Option<KernelArg> {
        let dtype = self.dtype(&stmt.dtype)?;
        if !self.claim_name(&stmt.name, taken) {
            return None;
        }
        self.dtypes.insert(stmt.name.name.clone(), dtype);
        let name = stmt.name.name.clone();
        let mut shape = Vec::with_capacity(stmt.shape.len());
        for node in &stmt.shape {
            match self.lower(node, Dtype::Int64) {
                Ok(e) => shape.push(e),
                Err(d) => {
                    self.error(d);
                    return None;
                }
            }
        }
        Some(match stmt.kind {
            ArgKind::Global => KernelArg::Global { name, dtype, shape },
            ArgKind::Image => KernelArg::Image { name, dtype, shape },
            ArgKind::Scalar => KernelArg::Scalar {
                name,
                dtype,
                approximately: stmt.approximately.map_or(0, |(v, _)| v),
            },
        })
    }

    fn resolve_temp(
        &mut self,
        stmt: &TempStmt,
        taken: &mut BTreeSet<String>,
    ) -> Option<TemporaryVariable> {
        let dtype = self.dtype(&stmt.dtype)?;
        if !self.claim_name(&stmt.name, taken) {
            return None;
        }
        self.dtypes.insert(stmt.name.name.clone(), dtype);
        let mut shape = Vec::with_capacity(stmt.shape.len());
        for node in &stmt.shape {
            let extent = self
                .lower(node, Dtype::Int64)
                .ok()
                .and_then(|e| e.eval_int(&HashMap::new()))
                .filter(|n| *n > 0);
            match extent {
                Some(n) => shape.push(n),
                None => {
                    self.error(Diagnostic::error(
                        codes::E0109,
                        at(node.span),
                        format!(
                            "temporary '{}' needs positive constant extents",
                            stmt.name.name
                        ),
                    ));
                    return None;
                }
            }
        }
        Some(TemporaryVariable::new(&stmt.name.name, dtype, shape))
    }

    // ── Instructions ──

    fn resolve_instructions(&mut self, stmts: &[(&InsnStmt, Span)]) -> Vec<Instruction> {
        let mut ids = UniqueNameGenerator::default();
        for (stmt, _) in stmts {
            if let Some(id) = &stmt.id {
                if !ids.add(&id.name) {
                    self.error(
                        Diagnostic::error(
                            codes::E0104,
                            Subject::Insn(id.name.clone()),
                            "instruction id is used twice",
                        )
                        .with_related(at(id.span), "used again here"),
                    );
                }
            }
        }
        let assigned: Vec<String> = stmts
            .iter()
            .map(|(stmt, _)| match &stmt.id {
                Some(id) => id.name.clone(),
                None => ids.fresh("insn"),
            })
            .collect();
        let known: BTreeSet<&str> = assigned.iter().map(String::as_str).collect();

        let mut out = Vec::with_capacity(stmts.len());
        for ((stmt, span), id) in stmts.iter().zip(&assigned) {
            let target = match &stmt.assignee.kind {
                ExprKind::Var(name) => name.as_str(),
                ExprKind::Subscript { aggregate, .. } => aggregate.name.as_str(),
                _ => "",
            };
            let dtype = self.dtypes.get(target).copied().unwrap_or(Dtype::Float32);
            let lowered = self
                .lower(&stmt.assignee, dtype)
                .and_then(|a| Ok((a, self.lower(&stmt.expression, dtype)?)));
            let (assignee, expression) = match lowered {
                Ok(pair) => pair,
                Err(d) => {
                    self.error(d.with_related(Subject::Insn(id.clone()), "in this instruction"));
                    continue;
                }
            };

            let mut insn = Instruction::new(id, assignee, expression);
            for dep in &stmt.deps {
                if known.contains(dep.name.as_str()) {
                    insn.insn_deps.insert(dep.name.clone());
                } else {
                    self.error(
                        Diagnostic::error(
                            codes::E0105,
                            Subject::Insn(id.clone()),
                            format!("depends on unknown instruction '{}'", dep.name),
                        )
                        .with_related(at(dep.span), "named here"),
                    );
                }
            }
            for iname in &stmt.inames {
                if self.dims.contains(&iname.name) {
                    insn.forced_iname_deps.insert(iname.name.clone());
                } else {
                    self.error(
                        Diagnostic::error(
                            codes::E0101,
                            Subject::Iname(iname.name.clone()),
                            "inames(...) names something that is not a domain dimension",
                        )
                        .with_related(at(*span), "in this instruction"),
                    );
                }
            }
            out.push(insn);
        }
        out
    }

    // ── Expressions ──

    /// Lower an AST expression. `dtype` is the element type of reductions.
    fn lower(&self, node: &ExprNode, dtype: Dtype) -> Result<Expr, Diagnostic> {
        let lower_all = |nodes: &[ExprNode]| -> Result<Vec<Expr>, Diagnostic> {
            nodes.iter().map(|n| self.lower(n, dtype)).collect()
        };
        Ok(match &node.kind {
            ExprKind::Int(n) => Expr::Int(*n),
            ExprKind::Float(x) => Expr::Float(*x),
            ExprKind::Var(name) => Expr::Var(name.clone()),
            ExprKind::Tagged { name, tag } => Expr::Tagged {
                name: name.clone(),
                tag: tag.clone(),
            },
            ExprKind::Subscript { aggregate, index } => Expr::Subscript {
                aggregate: aggregate.name.clone(),
                index: lower_all(index)?,
            },
            ExprKind::Neg(inner) => Expr::negate(self.lower(inner, dtype)?),
            ExprKind::Binary { op, lhs, rhs } => {
                let (l, r) = (self.lower(lhs, dtype)?, self.lower(rhs, dtype)?);
                match op {
                    BinOp::Add => Expr::add(l, r),
                    BinOp::Sub => Expr::sub(l, r),
                    BinOp::Mul => Expr::mul(l, r),
                    BinOp::Div => Expr::Quotient(Box::new(l), Box::new(r)),
                    BinOp::FloorDiv => Expr::FloorDiv(Box::new(l), Box::new(r)),
                    BinOp::Mod => Expr::Remainder(Box::new(l), Box::new(r)),
                    BinOp::Pow => Expr::Power(Box::new(l), Box::new(r)),
                }
            }
            ExprKind::Call { function, args } => Expr::Call {
                function: function.name.clone(),
                args: lower_all(args)?,
            },
            ExprKind::Reduce { op, inames, body } => {
                return self.lower_reduction(node.span, op, inames, body, dtype)
            }
        })
    }

    fn lower_reduction(
        &self,
        span: Span,
        op: &Ident,
        inames: &[ReductionIname],
        body: &ExprNode,
        dtype: Dtype,
    ) -> Result<Expr, Diagnostic> {
        let body = self.lower(body, dtype)?;
        let Some(kind) = ReductionKind::from_name(&op.name) else {
            return Err(Diagnostic::error(
                codes::E0108,
                at(op.span),
                format!("unknown reduction '{}'", op.name),
            ));
        };
        // `max(a, b)` over a non-iname is the binary function.
        if let [only] = inames {
            let binary = matches!(kind, ReductionKind::Max | ReductionKind::Min);
            if binary && !only.duplicate && !self.dims.contains(&only.name.name) {
                return Ok(Expr::Call {
                    function: op.name.clone(),
                    args: vec![Expr::Var(only.name.name.clone()), body],
                });
            }
        }
        let mut names = Vec::with_capacity(inames.len());
        for iname in inames {
            if !self.dims.contains(&iname.name.name) {
                return Err(Diagnostic::error(
                    codes::E0108,
                    Subject::Iname(iname.name.name.clone()),
                    "reduction over a name that is not a domain dimension",
                )
                .with_related(at(span), "reduction here"));
            }
            names.push(if iname.duplicate {
                format!("@{}", iname.name.name)
            } else {
                iname.name.name.clone()
            });
        }
        Ok(Expr::Reduction(Reduction {
            op: ReductionOp::new(kind, dtype),
            inames: names,
            expr: Box::new(body),
        }))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
