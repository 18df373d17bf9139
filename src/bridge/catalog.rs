//! # Native Method Catalog
//!
//! The fixed set of entry points the Java `NativeBridge` class declares.
//! A missing or renamed entry breaks the link when the library loads, so
//! the table is checked before any engine is created.

use crate::error::{VoidError, VoidResult};

/// Java class the entry points are bound to
pub const JNI_CLASS: &str = "dev/libs/bridge/NativeBridge";

/// Version of the catalog below
pub const API_VERSION: i32 = 1;

/// One native method: name and JNI descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeMethod {
    pub name: &'static str,
    pub signature: &'static str,
}

const fn method(name: &'static str, signature: &'static str) -> NativeMethod {
    NativeMethod { name, signature }
}

/// Every native method, grouped as in the Java class
pub const NATIVE_METHODS: &[NativeMethod] = &[
    // Lifecycle
    method("nativeCreateEngine", "([B)J"),
    method("nativeDestroyEngine", "(J)V"),
    method("nativeInitialize", "(J[B[B[B)Z"),
    method("nativeShutdown", "(J)V"),
    method("nativePause", "(J)V"),
    method("nativeResume", "(J)V"),
    // Version
    method("nativeGetVersion", "()Ljava/lang/String;"),
    method("nativeGetBuildTime", "()J"),
    method("nativeGetApiVersion", "()I"),
    // Frame
    method("nativeOnTick", "(JJF)V"),
    method("nativePrepareFrame", "(JF)V"),
    method(
        "nativeRenderWorld",
        "(JJFLjava/nio/FloatBuffer;Ljava/nio/FloatBuffer;)V",
    ),
    method("nativeCompositeFrame", "(J)V"),
    // Memory
    method("nativeAllocate", "(J)J"),
    method("nativeFree", "(J)V"),
    method("nativeSyncMemory", "(J)V"),
    method("nativeGetMemoryUsage", "(J)J"),
    // Entities
    method("nativeSpawnEntity", "(JILjava/lang/String;DDD)V"),
    method("nativeRemoveEntity", "(JI)V"),
    method("nativeUpdateEntity", "(JIDDDFF)V"),
    method(
        "nativeBatchUpdateEntities",
        "(JLjava/nio/IntBuffer;Ljava/nio/FloatBuffer;I)V",
    ),
    // Chunks
    method("nativeLoadChunk", "(JIILjava/nio/ByteBuffer;)V"),
    method("nativeUnloadChunk", "(JII)V"),
    method("nativeUpdateChunk", "(JIILjava/nio/ByteBuffer;)V"),
    method("nativeMarkChunkDirty", "(JII)V"),
    // Textures
    method(
        "nativeUploadTexture",
        "(JLjava/lang/String;Ljava/nio/ByteBuffer;III)J",
    ),
    method("nativeUnloadTexture", "(JJ)V"),
    // Audio
    method("nativePlaySound", "(JLjava/lang/String;FFFFF)V"),
    method("nativeStopSound", "(JLjava/lang/String;)V"),
    method("nativeUpdateListener", "(JFFFFF)V"),
    // Network
    method("nativeCompressPacket", "(J[B)[B"),
    method("nativeDecompressPacket", "(J[B)[B"),
    method("nativePredictState", "(JJLjava/nio/ByteBuffer;)V"),
    method("nativeReconcileState", "(JJLjava/nio/ByteBuffer;)V"),
    // Debug
    method("nativeGetDebugInfo", "(J)Ljava/lang/String;"),
    method("nativeSetDebugFlag", "(JLjava/lang/String;Z)V"),
    method("nativeGetProfileData", "(J)J"),
    // Callbacks
    method("nativeRegisterCallbacks", "(JLjava/lang/Object;)V"),
];

/// Look up a method by name
pub fn find(name: &str) -> Option<&'static NativeMethod> {
    NATIVE_METHODS.iter().find(|m| m.name == name)
}

/// Exported symbol name of a method
pub fn symbol(method: &NativeMethod) -> String {
    format!("Java_{}_{}", JNI_CLASS.replace('/', "_"), method.name)
}

/// Check that `probe` accepts every catalog entry. All missing methods are
/// reported at once.
pub fn verify_link(probe: impl Fn(&str) -> bool) -> VoidResult<()> {
    let missing: Vec<String> = NATIVE_METHODS
        .iter()
        .filter(|m| !probe(m.name))
        .map(|m| m.name.to_string())
        .collect();

    if missing.is_empty() {
        log::debug!("Native link verified ({} methods)", NATIVE_METHODS.len());
        Ok(())
    } else {
        log::error!("Native link failure, {} methods missing", missing.len());
        Err(VoidError::NativeLinkFailure { missing })
    }
}

/// Library version
pub fn version() -> &'static str {
    crate::VERSION
}

/// Build timestamp in seconds, 0 when the build did not record one
pub fn build_time() -> i64 {
    option_env!("SOURCE_DATE_EPOCH")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}
