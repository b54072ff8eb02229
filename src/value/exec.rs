//! Operator execution plans.
//!
//! Qual evaluation and field assignment run many times over different data
//! bindings. An [`OpPlan`] is built once — operand fields resolved, operator
//! text normalized, formatters constructed — and then executed repeatedly
//! with fresh [`OperandBind`]s. Tuple operands are pinned for exactly the
//! duration of one execution (the begin/end bracket is the buffer's closure
//! deref).
//!
//! Assignment fast-paths: identical stacks go through the memcopy access
//! method; text sources route through text-set; text targets through
//! text-get.

use std::sync::Arc;

use crate::heap::{HeapBufferTable, HeapTuplePtr};
use crate::schema::{HeapField, TupleDefVersion};
use crate::types::ops::CmpOp;
use crate::types::stack::TypeStack;
use crate::types::tam::{Formatter, split_stack};
use crate::{Error, Result};

use super::TypedSlot;

// ============================================================================
// Operand description (plan time)
// ============================================================================

/// How a plan identifies a tuple field.
#[derive(Debug, Clone)]
pub enum FieldSel {
    Name(String),
    Ordinal(u16),
    Field(Arc<HeapField>),
}

/// Where an operand's value will come from, described at plan time.
#[derive(Debug, Clone)]
pub enum OperandDesc {
    /// A typed slot supplied at execution.
    Slot(TypeStack),
    /// A field of a tuple supplied at execution.
    TupleField {
        tdv: Arc<TupleDefVersion>,
        sel: FieldSel,
    },
    /// A text literal parsed through the type's text access method,
    /// optionally with a formatter pattern.
    Text {
        stack: TypeStack,
        pattern: Option<String>,
    },
}

/// The per-execution data binding matching an [`OperandDesc`].
#[derive(Debug, Clone, Copy)]
pub enum OperandBind<'a> {
    Slot(&'a TypedSlot),
    Tuple(HeapTuplePtr),
    Text(&'a str),
}

// ============================================================================
// Resolved operands (execution time)
// ============================================================================

#[derive(Debug, Clone)]
struct ResolvedOperand {
    stack: TypeStack,
    field: Option<Arc<HeapField>>,
    formatter: Option<Formatter>,
}

impl ResolvedOperand {
    fn resolve(desc: &OperandDesc) -> Result<Self> {
        match desc {
            OperandDesc::Slot(stack) => Ok(Self {
                stack: stack.clone(),
                field: None,
                formatter: None,
            }),
            OperandDesc::TupleField { tdv, sel } => {
                let field = match sel {
                    FieldSel::Name(name) => Arc::clone(tdv.field_by_name(name)?),
                    FieldSel::Ordinal(ord) => Arc::clone(tdv.field(*ord)?),
                    FieldSel::Field(field) => Arc::clone(field),
                };
                Ok(Self {
                    stack: field.stack.clone(),
                    field: Some(field),
                    formatter: None,
                })
            }
            OperandDesc::Text { stack, pattern } => {
                let formatter = match pattern {
                    Some(p) => Some(stack.outermost().tam.make_formatter(p)?),
                    None => None,
                };
                Ok(Self {
                    stack: stack.clone(),
                    field: None,
                    formatter,
                })
            }
        }
    }

    /// The begin hook: materialize the operand as a typed slot, pinning a
    /// tuple operand only long enough to copy its field out.
    fn fetch(&self, heap: &HeapBufferTable, bind: OperandBind<'_>) -> Result<TypedSlot> {
        match (bind, &self.field) {
            (OperandBind::Slot(slot), _) => {
                if !slot.stack().matches(&self.stack) {
                    return Err(Error::SchemaMismatch(format!(
                        "bound slot is {}, plan expects {}",
                        slot.stack().describe(),
                        self.stack.describe()
                    )));
                }
                Ok(slot.clone())
            }
            (OperandBind::Tuple(htp), Some(field)) => {
                let buffer = heap.buffer_of(htp)?;
                buffer.with_tuple(htp, |tuple| tuple.get(field))
            }
            (OperandBind::Tuple(_), None) => Err(Error::PlanError(
                "tuple binding for an operand planned without a field".into(),
            )),
            (OperandBind::Text(text), _) => {
                TypedSlot::from_text(self.stack.clone(), text, self.formatter.as_ref())
            }
        }
    }
}

// ============================================================================
// OpPlan
// ============================================================================

enum PlanKind {
    Cmp(CmpOp),
    Binary(crate::types::ops::ResolvedOperator),
}

/// A prepared operator execution: resolved operands plus the dispatch for
/// one operator. Reusable across many bindings.
pub struct OpPlan {
    kind: PlanKind,
    lhs: ResolvedOperand,
    rhs: ResolvedOperand,
}

impl OpPlan {
    /// Prepare a comparison (`<`, `<=`, `=`, `!=`, `<>`, `>`, `>=`).
    pub fn compare(op_text: &str, lhs: OperandDesc, rhs: OperandDesc) -> Result<Self> {
        let lhs = ResolvedOperand::resolve(&lhs)?;
        let rhs = ResolvedOperand::resolve(&rhs)?;
        if !lhs.stack.matches(&rhs.stack) {
            return Err(Error::SchemaMismatch(format!(
                "comparison between {} and {}",
                lhs.stack.describe(),
                rhs.stack.describe()
            )));
        }
        Ok(Self {
            kind: PlanKind::Cmp(CmpOp::from_text(op_text)?),
            lhs,
            rhs,
        })
    }

    /// Prepare a registered binary operator (`+`, `||`, ...). Lookup is
    /// exact first, then swapped for commutative registrations.
    pub fn binary(
        registry: &crate::types::TypeRegistry,
        op_text: &str,
        lhs: OperandDesc,
        rhs: OperandDesc,
    ) -> Result<Self> {
        let lhs = ResolvedOperand::resolve(&lhs)?;
        let rhs = ResolvedOperand::resolve(&rhs)?;
        let resolved = registry.operators().lookup(
            lhs.stack.outermost().tag,
            op_text,
            rhs.stack.outermost().tag,
        )?;
        Ok(Self {
            kind: PlanKind::Binary(resolved),
            lhs,
            rhs,
        })
    }

    /// Execute a comparison plan. SQL-style null handling: a null operand
    /// satisfies nothing.
    pub fn execute_cmp(
        &self,
        heap: &HeapBufferTable,
        lhs: OperandBind<'_>,
        rhs: OperandBind<'_>,
    ) -> Result<bool> {
        let PlanKind::Cmp(op) = &self.kind else {
            return Err(Error::PlanError("not a comparison plan".into()));
        };
        let lhs = self.lhs.fetch(heap, lhs)?;
        let rhs = self.rhs.fetch(heap, rhs)?;
        if lhs.is_null() || rhs.is_null() {
            return Ok(false);
        }
        Ok(op.matches(lhs.compare(&rhs)?))
    }

    /// Execute a binary-operator plan, producing a fresh slot of the LHS
    /// stack.
    pub fn execute_binary(
        &self,
        heap: &HeapBufferTable,
        lhs: OperandBind<'_>,
        rhs: OperandBind<'_>,
    ) -> Result<TypedSlot> {
        let PlanKind::Binary(resolved) = &self.kind else {
            return Err(Error::PlanError("not a binary-operator plan".into()));
        };
        let lhs_slot = self.lhs.fetch(heap, lhs)?;
        let rhs_slot = self.rhs.fetch(heap, rhs)?;
        let (a, b) = match (lhs_slot.payload(), rhs_slot.payload()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(TypedSlot::null(lhs_slot.stack().clone())),
        };
        let out = if resolved.swapped {
            (resolved.func)(b, a)?
        } else {
            (resolved.func)(a, b)?
        };
        Ok(TypedSlot::from_payload(lhs_slot.stack().clone(), &out))
    }
}

// ============================================================================
// Assignment
// ============================================================================

/// Assign a value to a tuple field. Identical stacks fast-path through the
/// memcopy access method; text sources parse through text-set.
pub fn assign_field(
    heap: &HeapBufferTable,
    htp: HeapTuplePtr,
    field: &HeapField,
    value: OperandBind<'_>,
) -> Result<()> {
    let buffer = heap.buffer_of(htp)?;
    match value {
        OperandBind::Slot(slot) => {
            if field.stack.matches(slot.stack()) {
                match slot.payload() {
                    Some(payload) => {
                        let (outer, rest) = split_stack(&field.stack);
                        let copied = outer.tam.memcopy(rest, payload, false);
                        buffer.with_tuple_mut(htp, |t, scope| t.set_raw(field, &copied, scope))
                    }
                    None => buffer.with_tuple_mut(htp, |t, _| {
                        t.set_null(field);
                        Ok(())
                    }),
                }
            } else {
                Err(Error::SchemaMismatch(format!(
                    "cannot assign {} into field '{}' of {}",
                    slot.stack().describe(),
                    field.name,
                    field.stack.describe()
                )))
            }
        }
        OperandBind::Text(text) => {
            let parsed = {
                let (outer, rest) = split_stack(&field.stack);
                outer.tam.text_set(rest, text, None)?
            };
            buffer.with_tuple_mut(htp, |t, scope| t.set_raw(field, &parsed, scope))
        }
        OperandBind::Tuple(src) => {
            let src_buffer = heap.buffer_of(src)?;
            let value = src_buffer.with_tuple(src, |t| t.get(field))?;
            match value.payload() {
                Some(payload) => {
                    buffer.with_tuple_mut(htp, |t, scope| t.set_raw(field, payload, scope))
                }
                None => buffer.with_tuple_mut(htp, |t, _| {
                    t.set_null(field);
                    Ok(())
                }),
            }
        }
    }
}

/// Render a tuple field as text (the assignment-to-text route).
pub fn field_to_text(
    heap: &HeapBufferTable,
    htp: HeapTuplePtr,
    field: &HeapField,
    fmt: Option<&Formatter>,
) -> Result<String> {
    let buffer = heap.buffer_of(htp)?;
    let slot = buffer.with_tuple(htp, |t| t.get(field))?;
    slot.to_text(fmt)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemScope;
    use crate::schema::{TableCatalog, TableDef};
    use crate::types::TypeRegistry;
    use crate::types::builtin;

    struct Fixture {
        heap: HeapBufferTable,
        tdv: Arc<TupleDefVersion>,
        htp: HeapTuplePtr,
        _scope: MemScope,
    }

    fn fixture() -> Fixture {
        let catalog = TableCatalog::new();
        let table = catalog
            .add(
                TableDef::build("t")
                    .field("qty", &builtin::int64())
                    .field("label", &builtin::string()),
            )
            .unwrap();
        let tdv = table.leading();

        let heap = HeapBufferTable::new();
        let scope = MemScope::root("test");
        let no = heap.open(&scope, "t").unwrap();
        let buffer = heap.get(no).unwrap();
        let htp = buffer.alloc_tuple(&tdv).unwrap();

        let qty = tdv.field_by_name("qty").unwrap();
        buffer
            .with_tuple_mut(htp, |t, s| t.set(qty, &TypedSlot::int64(10), s))
            .unwrap();

        Fixture {
            heap,
            tdv,
            htp,
            _scope: scope,
        }
    }

    #[test]
    fn test_plan_once_execute_many() {
        let fx = fixture();
        let plan = OpPlan::compare(
            ">",
            OperandDesc::TupleField {
                tdv: Arc::clone(&fx.tdv),
                sel: FieldSel::Name("qty".into()),
            },
            OperandDesc::Slot(TypeStack::scalar(builtin::int64())),
        )
        .unwrap();

        let five = TypedSlot::int64(5);
        let fifty = TypedSlot::int64(50);

        assert!(
            plan.execute_cmp(&fx.heap, OperandBind::Tuple(fx.htp), OperandBind::Slot(&five))
                .unwrap()
        );
        assert!(
            !plan
                .execute_cmp(&fx.heap, OperandBind::Tuple(fx.htp), OperandBind::Slot(&fifty))
                .unwrap()
        );
    }

    #[test]
    fn test_cmp_null_never_matches() {
        let fx = fixture();
        let plan = OpPlan::compare(
            "=",
            OperandDesc::TupleField {
                tdv: Arc::clone(&fx.tdv),
                sel: FieldSel::Name("label".into()),
            },
            OperandDesc::Slot(TypeStack::scalar(builtin::string())),
        )
        .unwrap();

        let value = TypedSlot::string("x");
        // label is still null on the fixture tuple.
        assert!(
            !plan
                .execute_cmp(&fx.heap, OperandBind::Tuple(fx.htp), OperandBind::Slot(&value))
                .unwrap()
        );
    }

    #[test]
    fn test_text_operand_parses_through_type() {
        let fx = fixture();
        let plan = OpPlan::compare(
            "=",
            OperandDesc::TupleField {
                tdv: Arc::clone(&fx.tdv),
                sel: FieldSel::Ordinal(0),
            },
            OperandDesc::Text {
                stack: TypeStack::scalar(builtin::int64()),
                pattern: None,
            },
        )
        .unwrap();

        assert!(
            plan.execute_cmp(&fx.heap, OperandBind::Tuple(fx.htp), OperandBind::Text("10"))
                .unwrap()
        );
        assert!(
            !plan
                .execute_cmp(&fx.heap, OperandBind::Tuple(fx.htp), OperandBind::Text("11"))
                .unwrap()
        );
    }

    #[test]
    fn test_binary_operator_plan() {
        let fx = fixture();
        let registry = TypeRegistry::with_builtins().unwrap();
        let plan = OpPlan::binary(
            &registry,
            "+",
            OperandDesc::Slot(TypeStack::scalar(builtin::int64())),
            OperandDesc::Slot(TypeStack::scalar(builtin::int64())),
        )
        .unwrap();

        let a = TypedSlot::int64(40);
        let b = TypedSlot::int64(2);
        let sum = plan
            .execute_binary(&fx.heap, OperandBind::Slot(&a), OperandBind::Slot(&b))
            .unwrap();
        assert_eq!(sum.as_i64(), Some(42));
    }

    #[test]
    fn test_assign_fast_path_and_text_route() {
        let fx = fixture();
        let label = fx.tdv.field_by_name("label").unwrap();
        let qty = fx.tdv.field_by_name("qty").unwrap();

        assign_field(
            &fx.heap,
            fx.htp,
            label,
            OperandBind::Slot(&TypedSlot::string("widget")),
        )
        .unwrap();
        assign_field(&fx.heap, fx.htp, qty, OperandBind::Text("77")).unwrap();

        let buffer = fx.heap.buffer_of(fx.htp).unwrap();
        let (label_val, qty_val) = buffer
            .with_tuple(fx.htp, |t| Ok((t.get(label)?, t.get(qty)?)))
            .unwrap();
        assert_eq!(label_val.as_str(), Some("widget"));
        assert_eq!(qty_val.as_i64(), Some(77));

        assert_eq!(
            field_to_text(&fx.heap, fx.htp, qty, None).unwrap(),
            "77"
        );
    }
}
