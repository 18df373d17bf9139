//! # JNI Type Conversions
//!
//! Helpers for turning JNI arguments into Rust values.

use jni::objects::{JByteBuffer, JObject, JString};
use jni::sys::{jboolean, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;

/// Convert Rust bool to JNI boolean
#[inline]
pub fn to_jboolean(b: bool) -> jboolean {
    if b {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

/// Convert JNI boolean to Rust bool
#[inline]
pub fn from_jboolean(b: jboolean) -> bool {
    b != JNI_FALSE
}

/// Read a Java string; `None` for null or on conversion failure
pub fn java_string(env: &mut JNIEnv, s: &JString) -> Option<String> {
    if s.is_null() {
        return None;
    }
    match env.get_string(s) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            log::warn!("String conversion failed: {}", e);
            None
        }
    }
}

/// View the contents of a direct `ByteBuffer`
///
/// # Safety
/// The buffer must stay alive and unmodified by Java for `'a`.
pub unsafe fn direct_bytes<'a>(env: &JNIEnv, buffer: &JByteBuffer) -> Option<&'a [u8]> {
    direct_slice::<u8>(env, buffer)
}

/// View a direct `Buffer` as `T` elements; capacity is in elements, so this
/// works for `IntBuffer` and `FloatBuffer` as well
///
/// # Safety
/// The buffer must hold native-order `T` values and stay alive for `'a`.
pub unsafe fn direct_slice<'a, T>(env: &JNIEnv, buffer: &JByteBuffer) -> Option<&'a [T]> {
    if buffer.is_null() {
        return None;
    }

    let address = env.get_direct_buffer_address(buffer).ok()?;
    let len = env.get_direct_buffer_capacity(buffer).ok()?;
    if address.is_null() || (address as usize) % std::mem::align_of::<T>() != 0 {
        return None;
    }

    Some(std::slice::from_raw_parts(address as *const T, len))
}

/// Same as [`direct_slice`] for a buffer passed as a plain object
///
/// # Safety
/// See [`direct_slice`]; `object` must be a direct `java.nio.Buffer`.
pub unsafe fn direct_object_slice<'a, T>(env: &JNIEnv, object: JObject) -> Option<&'a [T]> {
    let buffer = JByteBuffer::from(object);
    direct_slice(env, &buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jboolean() {
        assert_eq!(to_jboolean(true), JNI_TRUE);
        assert_eq!(to_jboolean(false), JNI_FALSE);
        assert!(from_jboolean(JNI_TRUE));
        assert!(!from_jboolean(JNI_FALSE));
    }
}
