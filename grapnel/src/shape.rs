//! Batch application of replacement bundles, and accessor replacement with
//! chaining to the previous accessor.

use crate::{
    Hooks, HookError, ObjectType, Property, Runtime, Value,
    descriptor::DEFAULT_TYPE_ATTRS,
    objects::functions::AccessorPart,
    patch::propagate_cells,
};

#[derive(Debug, Clone)]
pub enum ShapeEntry {
    /// a callable replacement, installed through the patch engine
    Method(Value),
    /// a getter/setter/deleter bundle, composed with the previous accessor
    Accessor {
        get: Option<Value>,
        set: Option<Value>,
        del: Option<Value>,
    },
    /// a plain value, installed as a constant-returning accessor
    Constant(Value),
}

/// An ordered bundle of named replacements applied to one descriptor.
#[derive(Debug, Clone, Default)]
pub struct Shape {
    entries: Vec<(String, ShapeEntry)>,
}

impl Shape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, name: &str, f: Value) -> Self {
        self.entries.push((name.to_owned(), ShapeEntry::Method(f)));
        self
    }

    pub fn accessor(
        mut self,
        name: &str,
        get: Option<Value>,
        set: Option<Value>,
        del: Option<Value>,
    ) -> Self {
        self.entries
            .push((name.to_owned(), ShapeEntry::Accessor { get, set, del }));
        self
    }

    pub fn constant(mut self, name: &str, value: Value) -> Self {
        self.entries
            .push((name.to_owned(), ShapeEntry::Constant(value)));
        self
    }
}

fn wrap_part(
    rt: &mut Runtime,
    part: Option<Value>,
    name_v: Value,
    prev: Option<Value>,
    kind: AccessorPart,
) -> Option<Value> {
    part.map(|f| {
        if rt.heap_type_of(f) == Some(ObjectType::Function) {
            rt.clone_function_with_marker(f, name_v, prev, kind)
        } else {
            f
        }
    })
}

impl Hooks {
    /// Replace an accessor, composing with whatever it supersedes: provided
    /// halves are wrapped as accessor hooks bound to the previous accessor,
    /// missing halves fall back to the previous accessor's own halves.
    pub fn property_replacement(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        name: &str,
        get: Option<Value>,
        set: Option<Value>,
        del: Option<Value>,
    ) -> Result<(), HookError> {
        if !rt.is_type(tyv) {
            return Err(HookError::InvalidTarget);
        }
        let layout = self.layout(rt)?;
        let name_v = rt.intern(name);
        let prev = self.record_original(rt, tyv, name_v);

        let get_w = wrap_part(rt, get, name_v, prev, AccessorPart::Get);
        let set_w = wrap_part(rt, set, name_v, prev, AccessorPart::Set);
        let del_w = wrap_part(rt, del, name_v, prev, AccessorPart::Del);

        let prev_prop = prev.filter(|v| {
            rt.heap_type_of(*v) == Some(ObjectType::Property)
        });
        // SAFETY: filtered to property references just above
        let prev_prop =
            prev_prop.map(|v| unsafe { v.as_tagged_unchecked::<Property>().as_ref() });
        let final_get = get_w.or_else(|| prev_prop.and_then(|p| p.getter()));
        let final_set = set_w.or_else(|| prev_prop.and_then(|p| p.setter()));
        let final_del = del_w.or_else(|| prev_prop.and_then(|p| p.deleter()));

        let prop = rt.allocate_property(final_get, final_set, final_del);
        self.write_attr(rt, &layout, tyv, name_v, name, prop)?;
        propagate_cells(rt, &layout, tyv, name_v, prop.raw());
        Ok(())
    }

    /// Apply a whole shape to a descriptor: callables first (deterministic
    /// collision order), accessors composed, anything else as a hooked
    /// constant. Names from the universal base bundle are skipped.
    pub fn apply_shape(
        &mut self,
        rt: &mut Runtime,
        tyv: Value,
        shape: &Shape,
    ) -> Result<(), HookError> {
        let mut entries: Vec<&(String, ShapeEntry)> =
            shape.entries.iter().collect();
        entries.sort_by_key(|(_, e)| !matches!(e, ShapeEntry::Method(_)));
        for (name, entry) in entries {
            if DEFAULT_TYPE_ATTRS.contains(&name.as_str()) {
                log::debug!("shape: skipping base-bundle name '{name}'");
                continue;
            }
            match entry {
                ShapeEntry::Method(f) => {
                    self.install_operation(rt, tyv, name, *f)?;
                }
                ShapeEntry::Accessor { get, set, del } => {
                    self.property_replacement(rt, tyv, name, *get, *set, *del)?;
                }
                ShapeEntry::Constant(value) => {
                    let constant = *value;
                    let getter = rt.allocate_function(
                        "constant_hook",
                        1,
                        false,
                        move |_, _| Ok(constant),
                    );
                    self.property_replacement(
                        rt,
                        tyv,
                        name,
                        Some(getter),
                        None,
                        None,
                    )?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HookError, RuntimeCreateInfo, RuntimeError, orig};

    const SENTINEL: i64 = 31337;

    fn setup() -> (Runtime, Hooks) {
        (Runtime::new(RuntimeCreateInfo::default()), Hooks::new())
    }

    /// a user type with a real accessor: `x` reads and writes the instance
    /// attribute `raw_x`
    fn point_type(rt: &mut Runtime) -> Value {
        let tyv = rt.new_heap_type("point", rt.specials.object_type);
        let get = rt.allocate_function("point_x", 1, false, |rt, args| {
            rt.get_attr(args[0], "raw_x")
        });
        let set = rt.allocate_function("point_set_x", 2, false, |rt, args| {
            rt.set_attr(args[0], "raw_x", args[1])?;
            Ok(Value::zero())
        });
        let prop = rt.allocate_property(Some(get), Some(set), None);
        let name = rt.intern("x");
        rt.type_set_attr(tyv, name, prop).unwrap();
        tyv
    }

    #[test]
    fn getter_hook_keeps_previous_setter_reachable() {
        let (mut rt, mut hooks) = setup();
        let tyv = point_type(&mut rt);
        let obj = rt.new_instance(tyv);
        rt.set_attr(obj, "x", Value::from_fixnum(10)).unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(10));

        let old_prop = rt.type_attr(tyv, "x").unwrap();
        // SAFETY: the attribute is a property
        let old_set = unsafe {
            old_prop.as_tagged_unchecked::<Property>().as_ref()
        }
        .setter()
        .unwrap();

        let get_hook = rt.allocate_function("x_doubled", 1, false, |rt, _| {
            let raw = orig::original_get(rt)?;
            Ok(Value::from_fixnum(raw.as_fixnum().unwrap_or(0) * 2))
        });
        hooks
            .property_replacement(&mut rt, tyv, "x", Some(get_hook), None, None)
            .unwrap();

        // reads go through the hook, against the right receiver
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(20));
        // the previous setter is reachable through the new accessor unchanged
        let new_prop = rt.type_attr(tyv, "x").unwrap();
        // SAFETY: the attribute is a property
        let new_set = unsafe {
            new_prop.as_tagged_unchecked::<Property>().as_ref()
        }
        .setter()
        .unwrap();
        assert_eq!(new_set, old_set);
        rt.set_attr(obj, "x", Value::from_fixnum(21)).unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(42));

        hooks.remove_operation(&mut rt, tyv, "x").unwrap();
        assert_eq!(rt.type_attr(tyv, "x"), Some(old_prop));
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(21));
    }

    #[test]
    fn builtin_property_hook_recovers_the_receiver() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let get_hook =
            rt.allocate_function("magnitude_plus_one", 1, false, |rt, _| {
                let m = orig::original_get(rt)?;
                Ok(Value::from_fixnum(m.as_fixnum().unwrap_or(0) + 1))
            });
        hooks
            .property_replacement(
                &mut rt,
                fixnum,
                "magnitude",
                Some(get_hook),
                None,
                None,
            )
            .unwrap();
        let m = rt.get_attr(Value::from_fixnum(-5), "magnitude").unwrap();
        assert_eq!(m.as_fixnum(), Some(6));
        hooks.remove_operation(&mut rt, fixnum, "magnitude").unwrap();
        let m = rt.get_attr(Value::from_fixnum(-5), "magnitude").unwrap();
        assert_eq!(m.as_fixnum(), Some(5));
    }

    #[test]
    fn setter_hooks_write_through_the_previous_accessor() {
        let (mut rt, mut hooks) = setup();
        let tyv = point_type(&mut rt);
        let obj = rt.new_instance(tyv);

        // stores one more than what was assigned, through the old setter
        let set_hook = rt.allocate_function("x_bumped", 2, false, |rt, args| {
            let bumped =
                Value::from_fixnum(args[1].as_fixnum().unwrap_or(0) + 1);
            orig::original_set(rt, bumped)?;
            Ok(Value::zero())
        });
        hooks
            .property_replacement(&mut rt, tyv, "x", None, Some(set_hook), None)
            .unwrap();

        rt.set_attr(obj, "x", Value::from_fixnum(7)).unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(8));

        hooks.remove_operation(&mut rt, tyv, "x").unwrap();
        rt.set_attr(obj, "x", Value::from_fixnum(7)).unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(7));
    }

    #[test]
    fn receiverless_hooks_fail_self_binding() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let bad = rt.allocate_function("no_receiver", 0, false, |rt, _| {
            orig::original_get(rt)
        });
        hooks
            .property_replacement(
                &mut rt,
                fixnum,
                "magnitude",
                Some(bad),
                None,
                None,
            )
            .unwrap();
        let err = rt.get_attr(Value::from_fixnum(3), "magnitude").unwrap_err();
        assert_eq!(err, RuntimeError::Hook(HookError::SelfBindingFailure));
        hooks.remove_operation(&mut rt, fixnum, "magnitude").unwrap();
    }

    #[test]
    fn shapes_install_methods_and_constants() {
        let (mut rt, mut hooks) = setup();
        let fixnum = rt.specials.fixnum_type;
        let mul_hook = rt.allocate_function("mul_hook", 2, false, |rt, args| {
            let product = orig::call_original(rt, args)?;
            Ok(Value::from_fixnum(
                product.as_fixnum().unwrap_or(0) + SENTINEL,
            ))
        });
        let shape = Shape::new()
            .constant("answer", Value::from_fixnum(42))
            .method("mul", mul_hook)
            .constant("doc", Value::from_fixnum(0));
        hooks.apply_shape(&mut rt, fixnum, &shape).unwrap();

        // the callable is a replacement with a working original
        let r = rt
            .binary("mul", Value::from_fixnum(6), Value::from_fixnum(7))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(42 + SENTINEL));
        // the plain value reads back through a constant accessor
        let a = rt.get_attr(Value::from_fixnum(1), "answer").unwrap();
        assert_eq!(a.as_fixnum(), Some(42));
        // the base-bundle name was skipped
        assert!(!hooks.is_active(&mut rt, fixnum, "doc"));

        // both installs are uninstallable through the same path
        hooks.remove_operation(&mut rt, fixnum, "mul").unwrap();
        hooks.remove_operation(&mut rt, fixnum, "answer").unwrap();
        let r = rt
            .binary("mul", Value::from_fixnum(6), Value::from_fixnum(7))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(42));
        assert!(rt.get_attr(Value::from_fixnum(1), "answer").is_err());
    }

    #[test]
    fn chained_accessor_hooks_peel_in_order() {
        let (mut rt, mut hooks) = setup();
        let tyv = point_type(&mut rt);
        let obj = rt.new_instance(tyv);
        rt.set_attr(obj, "x", Value::from_fixnum(1)).unwrap();
        let original_prop = rt.type_attr(tyv, "x").unwrap();

        let double = rt.allocate_function("double", 1, false, |rt, _| {
            let raw = orig::original_get(rt)?;
            Ok(Value::from_fixnum(raw.as_fixnum().unwrap_or(0) * 2))
        });
        let negate = rt.allocate_function("negate", 1, false, |rt, _| {
            let prev = orig::original_get(rt)?;
            Ok(Value::from_fixnum(-prev.as_fixnum().unwrap_or(0)))
        });
        hooks
            .property_replacement(&mut rt, tyv, "x", Some(double), None, None)
            .unwrap();
        hooks
            .property_replacement(&mut rt, tyv, "x", Some(negate), None, None)
            .unwrap();

        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(-2));
        hooks.remove_operation(&mut rt, tyv, "x").unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(2));
        hooks.remove_operation(&mut rt, tyv, "x").unwrap();
        assert_eq!(rt.get_attr(obj, "x").unwrap().as_fixnum(), Some(1));
        assert_eq!(rt.type_attr(tyv, "x"), Some(original_prop));
    }
}
