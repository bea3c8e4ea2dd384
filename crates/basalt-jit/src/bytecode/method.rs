//! Method metadata
//!
//! The runtime exposes each method through [`MethodSource`]. Symbolic
//! references (catch types, fields, callees, classes) are resolved lazily and
//! any resolution may fail.

/// Static type of a value held in a local slot or on the operand stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Long,
    Float,
    Double,
    Ref,
    /// Return address pushed by `jsr`
    ReturnAddress,
}

impl ValueType {
    /// 64-bit payload
    pub fn is_wide(self) -> bool {
        matches!(self, ValueType::Long | ValueType::Double)
    }

    /// Lives in the floating-point register file
    pub fn is_float(self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }

    pub fn is_reference(self) -> bool {
        self == ValueType::Ref
    }
}

/// Runtime-assigned method identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Parameter and return types of a method
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub ret: Option<ValueType>,
}

impl Signature {
    pub fn new(params: Vec<ValueType>, ret: Option<ValueType>) -> Self {
        Signature { params, ret }
    }
}

/// One row of a method's exception table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// First protected PC (inclusive)
    pub start_pc: u32,
    /// End of the protected region (exclusive)
    pub end_pc: u32,
    /// Handler entry PC
    pub handler_pc: u32,
    /// Constant-pool index of the caught class; `None` catches everything
    pub catch_type: Option<u16>,
}

/// Resolved exception class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CatchType(pub u64);

/// Resolved instance field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    pub ty: ValueType,
    /// Byte offset from the object header
    pub offset: i32,
}

/// Resolved callee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    pub id: MethodId,
    pub signature: Signature,
}

/// Resolved class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassRef(pub u64);

/// Error resolving a symbolic reference
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("Unresolved {kind} reference #{index}")]
    Unresolved { kind: &'static str, index: u16 },
}

/// Metadata provider for one method
pub trait MethodSource: Send + Sync {
    fn id(&self) -> MethodId;
    fn name(&self) -> &str;
    /// Raw bytecode
    fn code(&self) -> &[u8];
    fn max_locals(&self) -> u16;
    fn max_stack(&self) -> u16;
    fn exception_table(&self) -> &[ExceptionEntry];
    fn signature(&self) -> &Signature;
    fn resolve_catch_type(&self, index: u16) -> Result<CatchType, ResolveError>;
    fn resolve_field(&self, index: u16) -> Result<FieldRef, ResolveError>;
    fn resolve_method(&self, index: u16) -> Result<MethodRef, ResolveError>;
    fn resolve_class(&self, index: u16) -> Result<ClassRef, ResolveError>;
}

/// Resolved symbols addressed by 16-bit indices
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    catch_types: Vec<CatchType>,
    fields: Vec<FieldRef>,
    methods: Vec<MethodRef>,
    classes: Vec<ClassRef>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_catch_type(&mut self, ty: CatchType) -> u16 {
        push_indexed(&mut self.catch_types, ty)
    }

    pub fn add_field(&mut self, field: FieldRef) -> u16 {
        push_indexed(&mut self.fields, field)
    }

    pub fn add_method(&mut self, method: MethodRef) -> u16 {
        push_indexed(&mut self.methods, method)
    }

    pub fn add_class(&mut self, class: ClassRef) -> u16 {
        push_indexed(&mut self.classes, class)
    }
}

fn push_indexed<T>(items: &mut Vec<T>, item: T) -> u16 {
    let index = u16::try_from(items.len()).expect("constant pool overflow");
    items.push(item);
    index
}

fn lookup<T: Clone>(items: &[T], kind: &'static str, index: u16) -> Result<T, ResolveError> {
    items
        .get(index as usize)
        .cloned()
        .ok_or(ResolveError::Unresolved { kind, index })
}

/// In-memory method with its own constant pool
#[derive(Debug, Clone)]
pub struct Method {
    pub id: MethodId,
    pub name: String,
    pub code: Vec<u8>,
    pub max_locals: u16,
    pub max_stack: u16,
    pub exception_table: Vec<ExceptionEntry>,
    pub signature: Signature,
    pub pool: ConstantPool,
}

impl Method {
    pub fn new(id: MethodId, name: impl Into<String>, code: Vec<u8>) -> Self {
        Method {
            id,
            name: name.into(),
            code,
            max_locals: 0,
            max_stack: 0,
            exception_table: Vec::new(),
            signature: Signature::default(),
            pool: ConstantPool::new(),
        }
    }

    pub fn with_limits(mut self, max_locals: u16, max_stack: u16) -> Self {
        self.max_locals = max_locals;
        self.max_stack = max_stack;
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_handler(mut self, entry: ExceptionEntry) -> Self {
        self.exception_table.push(entry);
        self
    }

    pub fn with_pool(mut self, pool: ConstantPool) -> Self {
        self.pool = pool;
        self
    }
}

impl MethodSource for Method {
    fn id(&self) -> MethodId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn code(&self) -> &[u8] {
        &self.code
    }

    fn max_locals(&self) -> u16 {
        self.max_locals
    }

    fn max_stack(&self) -> u16 {
        self.max_stack
    }

    fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn resolve_catch_type(&self, index: u16) -> Result<CatchType, ResolveError> {
        lookup(&self.pool.catch_types, "catch type", index)
    }

    fn resolve_field(&self, index: u16) -> Result<FieldRef, ResolveError> {
        lookup(&self.pool.fields, "field", index)
    }

    fn resolve_method(&self, index: u16) -> Result<MethodRef, ResolveError> {
        lookup(&self.pool.methods, "method", index)
    }

    fn resolve_class(&self, index: u16) -> Result<ClassRef, ResolveError> {
        lookup(&self.pool.classes, "class", index)
    }
}
