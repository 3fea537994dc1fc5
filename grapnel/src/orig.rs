//! Reaching the implementation a replacement superseded, from inside the
//! replacement body.
//!
//! Resolution is dynamic: the active call-frame stack is walked from the
//! innermost frame outward until a frame whose executing function carries a
//! hook marker is found; the marker binds the exact value that was current
//! when that particular layer was installed. Nested layers therefore each
//! reach their own immediate predecessor.

use crate::{
    Function, HookError, HookMarker, ObjectType, Property, Runtime,
    RuntimeError, Value,
};

fn innermost_marker(rt: &Runtime) -> Result<(HookMarker, usize), HookError> {
    for (index, frame) in rt.frames().iter().enumerate().rev() {
        if let Some(marker) = rt.function_marker(frame.function) {
            return Ok((marker, index));
        }
    }
    Err(HookError::OriginalNotFound)
}

/// Recover the receiver from the marked frame: the first fixed positional
/// argument, or the first variadic argument when the function declares no
/// fixed parameters.
fn recover_self(rt: &Runtime, frame_index: usize) -> Result<Value, HookError> {
    let frame = &rt.frames()[frame_index];
    // SAFETY: frames only ever hold function values
    let func =
        unsafe { frame.function.as_tagged_unchecked::<Function>().as_ref() };
    if (func.params() > 0 || func.is_variadic())
        && let Some(recv) = frame.args.first()
    {
        return Ok(*recv);
    }
    Err(HookError::SelfBindingFailure)
}

/// Invoke the original implementation with the given arguments. Usable only
/// from within a replacement body; anywhere else there is no marked frame
/// and the call reports `OriginalNotFound`.
pub fn call_original(
    rt: &mut Runtime,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let (marker, _) = innermost_marker(rt)?;
    let original = marker.orig.ok_or(HookError::OriginalNotFound)?;
    rt.call_value(original, args)
}

fn original_accessor(
    rt: &Runtime,
) -> Result<(Value, Value), RuntimeError> {
    let (marker, index) = innermost_marker(rt)?;
    let original = marker.orig.ok_or(HookError::OriginalNotFound)?;
    let recv = recover_self(rt, index)?;
    Ok((original, recv))
}

/// Read through the accessor this replacement superseded, bound to the
/// receiver recovered from the replacement's own frame.
pub fn original_get(rt: &mut Runtime) -> Result<Value, RuntimeError> {
    let (original, recv) = original_accessor(rt)?;
    match rt.heap_type_of(original) {
        Some(ObjectType::Property) => {
            // SAFETY: checked
            let prop =
                unsafe { original.as_tagged_unchecked::<Property>().as_ref() };
            match prop.getter() {
                Some(get) => rt.call_value(get, &[recv]),
                None => Err(HookError::OriginalNotFound.into()),
            }
        }
        Some(ObjectType::Function) => rt.call_value(original, &[recv]),
        // a plain previous attribute reads back as itself
        _ => Ok(original),
    }
}

/// Write through the superseded accessor.
pub fn original_set(
    rt: &mut Runtime,
    value: Value,
) -> Result<(), RuntimeError> {
    let (original, recv) = original_accessor(rt)?;
    match rt.heap_type_of(original) {
        Some(ObjectType::Property) => {
            // SAFETY: checked
            let prop =
                unsafe { original.as_tagged_unchecked::<Property>().as_ref() };
            match prop.setter() {
                Some(set) => rt.call_value(set, &[recv, value]).map(|_| ()),
                None => Err(HookError::OriginalNotFound.into()),
            }
        }
        _ => Err(HookError::OriginalNotFound.into()),
    }
}

/// Delete through the superseded accessor.
pub fn original_delete(rt: &mut Runtime) -> Result<(), RuntimeError> {
    let (original, recv) = original_accessor(rt)?;
    match rt.heap_type_of(original) {
        Some(ObjectType::Property) => {
            // SAFETY: checked
            let prop =
                unsafe { original.as_tagged_unchecked::<Property>().as_ref() };
            match prop.deleter() {
                Some(del) => rt.call_value(del, &[recv]).map(|_| ()),
                None => Err(HookError::OriginalNotFound.into()),
            }
        }
        _ => Err(HookError::OriginalNotFound.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Hooks, RuntimeCreateInfo, RuntimeError};

    #[test]
    fn call_original_outside_any_replacement_is_an_error() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let err = call_original(&mut rt, &[Value::from_fixnum(1)]).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Hook(HookError::OriginalNotFound)
        );
    }

    #[test]
    fn call_original_from_a_plain_function_is_an_error() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let f = rt.allocate_function("plain", 1, false, |rt, args| {
            call_original(rt, args)
        });
        let err = rt.call_value(f, &[Value::from_fixnum(1)]).unwrap_err();
        assert_eq!(err, RuntimeError::Hook(HookError::OriginalNotFound));
    }

    #[test]
    fn resolution_walks_past_unmarked_frames() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let mut hooks = Hooks::new();
        let fixnum = rt.specials.fixnum_type;

        // the hook calls a helper, the helper calls the original; the walk
        // must pass over the helper's unmarked frame
        let helper = rt.allocate_function("helper", 0, true, |rt, args| {
            call_original(rt, args)
        });
        let hook = rt.allocate_function("indirect", 2, false, move |rt, args| {
            rt.call_value(helper, args)
        });
        hooks
            .install_operation(&mut rt, fixnum, "add", hook)
            .unwrap();
        let r = rt
            .binary("add", Value::from_fixnum(4), Value::from_fixnum(5))
            .unwrap();
        assert_eq!(r.as_fixnum(), Some(9));
        hooks.remove_operation(&mut rt, fixnum, "add").unwrap();
    }

    #[test]
    fn absent_original_has_nothing_to_call() {
        let mut rt = Runtime::new(RuntimeCreateInfo::default());
        let mut hooks = Hooks::new();
        let fixnum = rt.specials.fixnum_type;
        let hook = rt.allocate_function("matmul_hook", 2, false, |rt, args| {
            call_original(rt, args)
        });
        hooks
            .install_operation(&mut rt, fixnum, "matmul", hook)
            .unwrap();
        let err = rt
            .binary("matmul", Value::from_fixnum(1), Value::from_fixnum(2))
            .unwrap_err();
        assert_eq!(err, RuntimeError::Hook(HookError::OriginalNotFound));
        hooks.remove_operation(&mut rt, fixnum, "matmul").unwrap();
    }
}
