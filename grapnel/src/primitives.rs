//! Native implementations backing the bootstrap types.

use crate::{
    Array, ByteArray, Dict, ObjectType, Runtime, RuntimeError, Value,
};

fn fixnum_arg(args: &[Value], i: usize, op: &str) -> Result<i64, RuntimeError> {
    args.get(i)
        .and_then(|v| v.as_fixnum())
        .ok_or_else(|| RuntimeError::UnsupportedOperation(op.to_owned()))
}

fn bytes_arg<'a>(
    rt: &Runtime,
    args: &[Value],
    i: usize,
    op: &str,
) -> Result<&'a ByteArray, RuntimeError> {
    let v = args
        .get(i)
        .copied()
        .ok_or_else(|| RuntimeError::UnsupportedOperation(op.to_owned()))?;
    if rt.heap_type_of(v) != Some(ObjectType::ByteArray) {
        return Err(RuntimeError::UnsupportedOperation(op.to_owned()));
    }
    // SAFETY: checked, arena storage never moves
    Ok(unsafe { v.as_tagged_unchecked::<ByteArray>().as_ref() })
}

fn bool_value(b: bool) -> Value {
    Value::from_fixnum(b as i64)
}

// ---- object ------------------------------------------------------------

fn object_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let recv = args.first().copied().unwrap_or(Value::zero());
    let name = rt.type_name(rt.type_of(recv));
    Ok(rt.allocate_bytearray(format!("<{name}>").as_bytes()))
}

fn object_eq(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let a = args.first().copied().unwrap_or(Value::zero());
    let b = args.get(1).copied().unwrap_or(Value::zero());
    Ok(bool_value(a == b))
}

fn object_hash(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let recv = args.first().copied().unwrap_or(Value::zero());
    Ok(Value::from_fixnum(
        ((recv.raw() >> 3) & 0x0FFF_FFFF_FFFF_FFFF) as i64,
    ))
}

fn object_str(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let recv = args
        .first()
        .copied()
        .ok_or_else(|| RuntimeError::UnsupportedOperation("str".to_owned()))?;
    rt.operate("repr", &[recv])
}

// ---- fixnum ------------------------------------------------------------

fn fixnum_add(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "add")?, fixnum_arg(args, 1, "add")?);
    Ok(Value::from_fixnum(a.wrapping_add(b)))
}

fn fixnum_sub(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "sub")?, fixnum_arg(args, 1, "sub")?);
    Ok(Value::from_fixnum(a.wrapping_sub(b)))
}

fn fixnum_mul(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "mul")?, fixnum_arg(args, 1, "mul")?);
    Ok(Value::from_fixnum(a.wrapping_mul(b)))
}

fn fixnum_div(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "div")?, fixnum_arg(args, 1, "div")?);
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    Ok(Value::from_fixnum(a.wrapping_div(b)))
}

fn fixnum_rem(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "rem")?, fixnum_arg(args, 1, "rem")?);
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    Ok(Value::from_fixnum(a.wrapping_rem(b)))
}

fn fixnum_neg(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(fixnum_arg(args, 0, "neg")?.wrapping_neg()))
}

fn fixnum_abs(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(fixnum_arg(args, 0, "abs")?.wrapping_abs()))
}

fn fixnum_eq(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "eq")?, fixnum_arg(args, 1, "eq")?);
    Ok(bool_value(a == b))
}

fn fixnum_lt(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let (a, b) = (fixnum_arg(args, 0, "lt")?, fixnum_arg(args, 1, "lt")?);
    Ok(bool_value(a < b))
}

fn fixnum_hash(_rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(fixnum_arg(args, 0, "hash")?))
}

fn fixnum_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let a = fixnum_arg(args, 0, "repr")?;
    Ok(rt.allocate_bytearray(a.to_string().as_bytes()))
}

// ---- bytearray ---------------------------------------------------------

fn bytearray_concat(
    rt: &mut Runtime,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let a = bytes_arg(rt, args, 0, "add")?;
    let b = bytes_arg(rt, args, 1, "add")?;
    let mut joined = Vec::with_capacity(a.size() + b.size());
    joined.extend_from_slice(a.as_bytes());
    joined.extend_from_slice(b.as_bytes());
    Ok(rt.allocate_bytearray(&joined))
}

fn bytearray_len(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(bytes_arg(rt, args, 0, "len")?.size() as i64))
}

fn bytearray_item(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let bytes = bytes_arg(rt, args, 0, "item")?;
    let index = fixnum_arg(args, 1, "item")?;
    let byte = usize::try_from(index)
        .ok()
        .and_then(|i| bytes.as_bytes().get(i).copied())
        .ok_or(RuntimeError::IndexOutOfBounds)?;
    Ok(Value::from_fixnum(byte as i64))
}

fn bytearray_contains(
    rt: &mut Runtime,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let bytes = bytes_arg(rt, args, 0, "contains")?;
    let needle = fixnum_arg(args, 1, "contains")?;
    let found = u8::try_from(needle)
        .map(|b| bytes.as_bytes().contains(&b))
        .unwrap_or(false);
    Ok(bool_value(found))
}

fn bytearray_eq(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let a = bytes_arg(rt, args, 0, "eq")?;
    let b = bytes_arg(rt, args, 1, "eq")?;
    Ok(bool_value(a.as_bytes() == b.as_bytes()))
}

fn bytearray_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let bytes = bytes_arg(rt, args, 0, "repr")?;
    Ok(rt.allocate_bytearray(bytes.as_bytes()))
}

// ---- array -------------------------------------------------------------

fn array_arg<'a>(
    rt: &Runtime,
    args: &[Value],
    op: &str,
) -> Result<&'a mut Array, RuntimeError> {
    let v = args
        .first()
        .copied()
        .ok_or_else(|| RuntimeError::UnsupportedOperation(op.to_owned()))?;
    if rt.heap_type_of(v) != Some(ObjectType::Array) {
        return Err(RuntimeError::UnsupportedOperation(op.to_owned()));
    }
    // SAFETY: checked, arena storage never moves
    Ok(unsafe { v.as_tagged_unchecked::<Array>().as_mut() })
}

fn array_len(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(array_arg(rt, args, "len")?.size() as i64))
}

fn array_item(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(rt, args, "item")?;
    let index = fixnum_arg(args, 1, "item")?;
    usize::try_from(index)
        .ok()
        .and_then(|i| array.get(i))
        .ok_or(RuntimeError::IndexOutOfBounds)
}

fn array_set_item(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(rt, args, "set_item")?;
    let index = fixnum_arg(args, 1, "set_item")?;
    let value = args.get(2).copied().ok_or_else(|| {
        RuntimeError::UnsupportedOperation("set_item".to_owned())
    })?;
    let ok = usize::try_from(index)
        .map(|i| array.set(i, value))
        .unwrap_or(false);
    if !ok {
        return Err(RuntimeError::IndexOutOfBounds);
    }
    Ok(value)
}

fn array_contains(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(rt, args, "contains")?;
    let needle = args.get(1).copied().unwrap_or(Value::zero());
    Ok(bool_value(array.fields().contains(&needle)))
}

fn array_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let array = array_arg(rt, args, "repr")?;
    let text = format!("array[{}]", array.size());
    Ok(rt.allocate_bytearray(text.as_bytes()))
}

// ---- dict --------------------------------------------------------------

fn dict_arg<'a>(
    rt: &Runtime,
    args: &[Value],
    op: &str,
) -> Result<&'a Dict, RuntimeError> {
    let v = args
        .first()
        .copied()
        .ok_or_else(|| RuntimeError::UnsupportedOperation(op.to_owned()))?;
    if rt.heap_type_of(v) != Some(ObjectType::Dict) {
        return Err(RuntimeError::UnsupportedOperation(op.to_owned()));
    }
    // SAFETY: checked, arena storage never moves
    Ok(unsafe { v.as_tagged_unchecked::<Dict>().as_ref() })
}

fn dict_len(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::from_fixnum(dict_arg(rt, args, "len")?.len() as i64))
}

fn dict_item(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = dict_arg(rt, args, "item")?;
    let key = args.get(1).copied().unwrap_or(Value::zero());
    dict.lookup(key).ok_or(RuntimeError::IndexOutOfBounds)
}

fn dict_set_item(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let dictv = args.first().copied().ok_or_else(|| {
        RuntimeError::UnsupportedOperation("set_item".to_owned())
    })?;
    // type check through the shared helper
    dict_arg(rt, args, "set_item")?;
    let key = args.get(1).copied().ok_or_else(|| {
        RuntimeError::UnsupportedOperation("set_item".to_owned())
    })?;
    let value = args.get(2).copied().ok_or_else(|| {
        RuntimeError::UnsupportedOperation("set_item".to_owned())
    })?;
    rt.dict_set(dictv, key, value);
    Ok(value)
}

fn dict_contains(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = dict_arg(rt, args, "contains")?;
    let key = args.get(1).copied().unwrap_or(Value::zero());
    Ok(bool_value(dict.contains(key)))
}

fn dict_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let dict = dict_arg(rt, args, "repr")?;
    let text = format!("dict[{}]", dict.len());
    Ok(rt.allocate_bytearray(text.as_bytes()))
}

// ---- callables ---------------------------------------------------------

fn function_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let recv = args.first().copied().unwrap_or(Value::zero());
    let text = if rt.heap_type_of(recv) == Some(ObjectType::Function) {
        // SAFETY: checked
        let f = unsafe { recv.as_tagged_unchecked::<crate::Function>().as_ref() };
        format!("<fn {}>", rt.sym(f.name))
    } else {
        "<fn>".to_owned()
    };
    Ok(rt.allocate_bytearray(text.as_bytes()))
}

fn property_repr(rt: &mut Runtime, _args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(rt.allocate_bytearray(b"<property>"))
}

fn type_repr(rt: &mut Runtime, args: &[Value]) -> Result<Value, RuntimeError> {
    let recv = args.first().copied().unwrap_or(Value::zero());
    let text = format!("<type {}>", rt.type_name(recv));
    Ok(rt.allocate_bytearray(text.as_bytes()))
}

// ---- bootstrap ---------------------------------------------------------

/// Create the builtin descriptors. Their namespaces carry the operations the
/// layout prober later enumerates; only populated sub-tables materialize.
pub(crate) fn bootstrap(rt: &mut Runtime) {
    let f_obj_repr = rt.allocate_function("object_repr", 1, false, object_repr);
    let f_obj_eq = rt.allocate_function("object_eq", 2, false, object_eq);
    let f_obj_hash = rt.allocate_function("object_hash", 1, false, object_hash);
    let f_obj_str = rt.allocate_function("object_str", 1, false, object_str);
    let object = rt.define_type(
        "object",
        Value::zero(),
        &[
            ("repr", f_obj_repr),
            ("eq", f_obj_eq),
            ("hash", f_obj_hash),
            ("str", f_obj_str),
        ],
    );
    rt.specials.object_type = object;

    let f_type_repr = rt.allocate_function("type_repr", 1, false, type_repr);
    rt.specials.type_type =
        rt.define_type("type", object, &[("repr", f_type_repr)]);

    let f_add = rt.allocate_function("fixnum_add", 2, false, fixnum_add);
    let f_sub = rt.allocate_function("fixnum_sub", 2, false, fixnum_sub);
    let f_mul = rt.allocate_function("fixnum_mul", 2, false, fixnum_mul);
    let f_div = rt.allocate_function("fixnum_div", 2, false, fixnum_div);
    let f_rem = rt.allocate_function("fixnum_rem", 2, false, fixnum_rem);
    let f_neg = rt.allocate_function("fixnum_neg", 1, false, fixnum_neg);
    let f_abs = rt.allocate_function("fixnum_abs", 1, false, fixnum_abs);
    let f_eq = rt.allocate_function("fixnum_eq", 2, false, fixnum_eq);
    let f_lt = rt.allocate_function("fixnum_lt", 2, false, fixnum_lt);
    let f_hash = rt.allocate_function("fixnum_hash", 1, false, fixnum_hash);
    let f_repr = rt.allocate_function("fixnum_repr", 1, false, fixnum_repr);
    let f_magnitude =
        rt.allocate_function("fixnum_magnitude", 1, false, fixnum_abs);
    let magnitude = rt.allocate_property(Some(f_magnitude), None, None);
    rt.specials.fixnum_type = rt.define_type(
        "fixnum",
        object,
        &[
            ("add", f_add),
            ("sub", f_sub),
            ("mul", f_mul),
            ("div", f_div),
            ("rem", f_rem),
            ("neg", f_neg),
            ("abs", f_abs),
            ("eq", f_eq),
            ("lt", f_lt),
            ("hash", f_hash),
            ("repr", f_repr),
            ("magnitude", magnitude),
        ],
    );

    let f_concat = rt.allocate_function("bytearray_concat", 2, false, bytearray_concat);
    let f_len = rt.allocate_function("bytearray_len", 1, false, bytearray_len);
    let f_item = rt.allocate_function("bytearray_item", 2, false, bytearray_item);
    let f_contains =
        rt.allocate_function("bytearray_contains", 2, false, bytearray_contains);
    let f_beq = rt.allocate_function("bytearray_eq", 2, false, bytearray_eq);
    let f_brepr = rt.allocate_function("bytearray_repr", 1, false, bytearray_repr);
    rt.specials.bytearray_type = rt.define_type(
        "bytearray",
        object,
        &[
            ("add", f_concat),
            ("len", f_len),
            ("item", f_item),
            ("contains", f_contains),
            ("eq", f_beq),
            ("repr", f_brepr),
        ],
    );

    let f_alen = rt.allocate_function("array_len", 1, false, array_len);
    let f_aitem = rt.allocate_function("array_item", 2, false, array_item);
    let f_aset = rt.allocate_function("array_set_item", 3, false, array_set_item);
    let f_acontains =
        rt.allocate_function("array_contains", 2, false, array_contains);
    let f_arepr = rt.allocate_function("array_repr", 1, false, array_repr);
    rt.specials.array_type = rt.define_type(
        "array",
        object,
        &[
            ("len", f_alen),
            ("item", f_aitem),
            ("set_item", f_aset),
            ("contains", f_acontains),
            ("repr", f_arepr),
        ],
    );

    let f_dlen = rt.allocate_function("dict_len", 1, false, dict_len);
    let f_ditem = rt.allocate_function("dict_item", 2, false, dict_item);
    let f_dset = rt.allocate_function("dict_set_item", 3, false, dict_set_item);
    let f_dcontains =
        rt.allocate_function("dict_contains", 2, false, dict_contains);
    let f_drepr = rt.allocate_function("dict_repr", 1, false, dict_repr);
    rt.specials.dict_type = rt.define_type(
        "dict",
        object,
        &[
            ("len", f_dlen),
            ("item", f_ditem),
            ("set_item", f_dset),
            ("contains", f_dcontains),
            ("repr", f_drepr),
        ],
    );

    let f_frepr = rt.allocate_function("function_repr", 1, false, function_repr);
    rt.specials.function_type =
        rt.define_type("function", object, &[("repr", f_frepr)]);

    let f_prepr = rt.allocate_function("property_repr", 1, false, property_repr);
    rt.specials.property_type =
        rt.define_type("property", object, &[("repr", f_prepr)]);
}
