//! Bytecode opcodes
//!
//! Every opcode is a single byte. Operands, when present, follow the opcode
//! byte in little-endian order. Branch offsets are relative to the PC of the
//! branching instruction.
//!
//! Opcodes are organized into categories:
//! - 0x00-0x0F: Constants
//! - 0x10-0x1F: Local variables
//! - 0x20-0x2F: Stack manipulation
//! - 0x30-0x3F: Integer arithmetic
//! - 0x40-0x5F: Long, float and double arithmetic
//! - 0x58-0x5F: Conversions
//! - 0x60-0x7F: Control flow
//! - 0x80-0x8F: Calls, objects and arrays

/// Bytecode opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Constants (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Push null reference
    AconstNull = 0x01,
    /// Push int 0
    Iconst0 = 0x02,
    /// Push int 1
    Iconst1 = 0x03,
    /// Push sign-extended byte (operand: i8)
    Bipush = 0x04,
    /// Push int constant (operand: i32)
    Ldc = 0x05,
    /// Push long constant (operand: i64)
    Lconst = 0x06,
    /// Push float constant (operand: f32)
    Fconst = 0x07,
    /// Push double constant (operand: f64)
    Dconst = 0x08,

    // ===== Local Variables (0x10-0x1F) =====
    /// Load int local (operand: u8 index)
    Iload = 0x10,
    /// Load long local (operand: u8 index)
    Lload = 0x11,
    /// Load float local (operand: u8 index)
    Fload = 0x12,
    /// Load double local (operand: u8 index)
    Dload = 0x13,
    /// Load reference local (operand: u8 index)
    Aload = 0x14,
    /// Store int local (operand: u8 index)
    Istore = 0x15,
    /// Store long local (operand: u8 index)
    Lstore = 0x16,
    /// Store float local (operand: u8 index)
    Fstore = 0x17,
    /// Store double local (operand: u8 index)
    Dstore = 0x18,
    /// Store reference or return address local (operand: u8 index)
    Astore = 0x19,
    /// Load int local 0
    Iload0 = 0x1A,
    /// Load int local 1
    Iload1 = 0x1B,
    /// Store int local 0
    Istore0 = 0x1C,
    /// Store int local 1
    Istore1 = 0x1D,
    /// Load reference local 0
    Aload0 = 0x1E,
    /// Increment int local (operands: u8 index, i8 delta)
    Iinc = 0x1F,

    // ===== Stack Manipulation (0x20-0x2F) =====
    /// Pop top value
    Pop = 0x20,
    /// Duplicate top value
    Dup = 0x21,
    /// Swap top two values
    Swap = 0x22,

    // ===== Integer Arithmetic (0x30-0x3F) =====
    Iadd = 0x30,
    Isub = 0x31,
    Imul = 0x32,
    Idiv = 0x33,
    Irem = 0x34,
    Ineg = 0x35,
    Iand = 0x36,
    Ior = 0x37,
    Ixor = 0x38,
    Ishl = 0x39,
    Ishr = 0x3A,

    // ===== Long / Float / Double Arithmetic (0x40-0x57) =====
    Ladd = 0x40,
    Lsub = 0x41,
    Lmul = 0x42,
    /// Compare two longs, push -1/0/1
    Lcmp = 0x43,
    Fadd = 0x48,
    Fsub = 0x49,
    Fmul = 0x4A,
    Fdiv = 0x4B,
    /// Compare two floats, push -1/0/1
    Fcmp = 0x4C,
    Dadd = 0x50,
    Dsub = 0x51,
    Dmul = 0x52,
    Ddiv = 0x53,
    /// Compare two doubles, push -1/0/1
    Dcmp = 0x54,

    // ===== Conversions (0x58-0x5F) =====
    I2l = 0x58,
    L2i = 0x59,
    I2f = 0x5A,
    F2i = 0x5B,
    I2d = 0x5C,
    D2i = 0x5D,

    // ===== Control Flow (0x60-0x7F) =====
    /// Branch if int == 0 (operand: i16 offset)
    Ifeq = 0x60,
    Ifne = 0x61,
    Iflt = 0x62,
    Ifge = 0x63,
    Ifgt = 0x64,
    Ifle = 0x65,
    /// Branch if two ints compare equal (operand: i16 offset)
    IfIcmpeq = 0x66,
    IfIcmpne = 0x67,
    IfIcmplt = 0x68,
    IfIcmpge = 0x69,
    IfIcmpgt = 0x6A,
    IfIcmple = 0x6B,
    /// Branch if two references are identical (operand: i16 offset)
    IfAcmpeq = 0x6C,
    IfAcmpne = 0x6D,
    /// Branch if reference is null (operand: i16 offset)
    Ifnull = 0x6E,
    Ifnonnull = 0x6F,
    /// Unconditional jump (operand: i16 offset)
    Goto = 0x70,
    /// Jump to subroutine, pushing the return address (operand: i16 offset)
    Jsr = 0x71,
    /// Return from subroutine through a local (operand: u8 index)
    Ret = 0x72,
    /// Dense switch (operands: default i32, low i32, high i32, offsets)
    Tableswitch = 0x73,
    /// Sparse switch (operands: default i32, npairs u32, key/offset pairs)
    Lookupswitch = 0x74,
    Ireturn = 0x78,
    Lreturn = 0x79,
    Freturn = 0x7A,
    Dreturn = 0x7B,
    Areturn = 0x7C,
    /// Return void
    Return = 0x7D,
    /// Throw the reference on top of the stack
    Athrow = 0x7E,

    // ===== Calls, Objects & Arrays (0x80-0x8F) =====
    /// Call a method (operand: u16 method reference)
    Invoke = 0x80,
    /// Allocate an object (operand: u16 class reference)
    New = 0x81,
    /// Read an instance field (operand: u16 field reference)
    Getfield = 0x82,
    /// Write an instance field (operand: u16 field reference)
    Putfield = 0x83,
    /// Allocate an int array of the popped length
    Newarray = 0x84,
    Arraylength = 0x85,
    Iaload = 0x86,
    Iastore = 0x87,
    Aaload = 0x88,
    Aastore = 0x89,
}

impl Opcode {
    /// Convert a raw byte into an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x00 => Nop,
            0x01 => AconstNull,
            0x02 => Iconst0,
            0x03 => Iconst1,
            0x04 => Bipush,
            0x05 => Ldc,
            0x06 => Lconst,
            0x07 => Fconst,
            0x08 => Dconst,

            0x10 => Iload,
            0x11 => Lload,
            0x12 => Fload,
            0x13 => Dload,
            0x14 => Aload,
            0x15 => Istore,
            0x16 => Lstore,
            0x17 => Fstore,
            0x18 => Dstore,
            0x19 => Astore,
            0x1A => Iload0,
            0x1B => Iload1,
            0x1C => Istore0,
            0x1D => Istore1,
            0x1E => Aload0,
            0x1F => Iinc,

            0x20 => Pop,
            0x21 => Dup,
            0x22 => Swap,

            0x30 => Iadd,
            0x31 => Isub,
            0x32 => Imul,
            0x33 => Idiv,
            0x34 => Irem,
            0x35 => Ineg,
            0x36 => Iand,
            0x37 => Ior,
            0x38 => Ixor,
            0x39 => Ishl,
            0x3A => Ishr,

            0x40 => Ladd,
            0x41 => Lsub,
            0x42 => Lmul,
            0x43 => Lcmp,
            0x48 => Fadd,
            0x49 => Fsub,
            0x4A => Fmul,
            0x4B => Fdiv,
            0x4C => Fcmp,
            0x50 => Dadd,
            0x51 => Dsub,
            0x52 => Dmul,
            0x53 => Ddiv,
            0x54 => Dcmp,

            0x58 => I2l,
            0x59 => L2i,
            0x5A => I2f,
            0x5B => F2i,
            0x5C => I2d,
            0x5D => D2i,

            0x60 => Ifeq,
            0x61 => Ifne,
            0x62 => Iflt,
            0x63 => Ifge,
            0x64 => Ifgt,
            0x65 => Ifle,
            0x66 => IfIcmpeq,
            0x67 => IfIcmpne,
            0x68 => IfIcmplt,
            0x69 => IfIcmpge,
            0x6A => IfIcmpgt,
            0x6B => IfIcmple,
            0x6C => IfAcmpeq,
            0x6D => IfAcmpne,
            0x6E => Ifnull,
            0x6F => Ifnonnull,
            0x70 => Goto,
            0x71 => Jsr,
            0x72 => Ret,
            0x73 => Tableswitch,
            0x74 => Lookupswitch,
            0x78 => Ireturn,
            0x79 => Lreturn,
            0x7A => Freturn,
            0x7B => Dreturn,
            0x7C => Areturn,
            0x7D => Return,
            0x7E => Athrow,

            0x80 => Invoke,
            0x81 => New,
            0x82 => Getfield,
            0x83 => Putfield,
            0x84 => Newarray,
            0x85 => Arraylength,
            0x86 => Iaload,
            0x87 => Iastore,
            0x88 => Aaload,
            0x89 => Aastore,
            _ => return None,
        };
        Some(op)
    }

    /// Convert opcode to its byte value
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Total encoded size in bytes, or `None` for the variable-length switches
    pub fn fixed_size(self) -> Option<usize> {
        use Opcode::*;
        let size = match self {
            Tableswitch | Lookupswitch => return None,
            Bipush | Iload | Lload | Fload | Dload | Aload | Istore | Lstore | Fstore
            | Dstore | Astore | Ret => 2,
            Ldc | Fconst => 5,
            Lconst | Dconst => 9,
            Iinc => 3,
            Ifeq | Ifne | Iflt | Ifge | Ifgt | Ifle | IfIcmpeq | IfIcmpne | IfIcmplt
            | IfIcmpge | IfIcmpgt | IfIcmple | IfAcmpeq | IfAcmpne | Ifnull | Ifnonnull
            | Goto | Jsr => 3,
            Invoke | New | Getfield | Putfield => 3,
            _ => 1,
        };
        Some(size)
    }

    /// Conditional branch with a single 16-bit target
    pub fn is_conditional_branch(self) -> bool {
        (0x60..=0x6F).contains(&(self as u8))
    }

    /// Unconditional transfer of control out of the method
    pub fn is_return(self) -> bool {
        matches!(
            self,
            Opcode::Ireturn
                | Opcode::Lreturn
                | Opcode::Freturn
                | Opcode::Dreturn
                | Opcode::Areturn
                | Opcode::Return
        )
    }

    /// Instructions that end a basic block
    pub fn is_terminator(self) -> bool {
        self.is_conditional_branch()
            || self.is_return()
            || matches!(
                self,
                Opcode::Goto
                    | Opcode::Jsr
                    | Opcode::Ret
                    | Opcode::Tableswitch
                    | Opcode::Lookupswitch
                    | Opcode::Athrow
            )
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            AconstNull => "aconst_null",
            Iconst0 => "iconst_0",
            Iconst1 => "iconst_1",
            Bipush => "bipush",
            Ldc => "ldc",
            Lconst => "lconst",
            Fconst => "fconst",
            Dconst => "dconst",
            Iload => "iload",
            Lload => "lload",
            Fload => "fload",
            Dload => "dload",
            Aload => "aload",
            Istore => "istore",
            Lstore => "lstore",
            Fstore => "fstore",
            Dstore => "dstore",
            Astore => "astore",
            Iload0 => "iload_0",
            Iload1 => "iload_1",
            Istore0 => "istore_0",
            Istore1 => "istore_1",
            Aload0 => "aload_0",
            Iinc => "iinc",
            Pop => "pop",
            Dup => "dup",
            Swap => "swap",
            Iadd => "iadd",
            Isub => "isub",
            Imul => "imul",
            Idiv => "idiv",
            Irem => "irem",
            Ineg => "ineg",
            Iand => "iand",
            Ior => "ior",
            Ixor => "ixor",
            Ishl => "ishl",
            Ishr => "ishr",
            Ladd => "ladd",
            Lsub => "lsub",
            Lmul => "lmul",
            Lcmp => "lcmp",
            Fadd => "fadd",
            Fsub => "fsub",
            Fmul => "fmul",
            Fdiv => "fdiv",
            Fcmp => "fcmp",
            Dadd => "dadd",
            Dsub => "dsub",
            Dmul => "dmul",
            Ddiv => "ddiv",
            Dcmp => "dcmp",
            I2l => "i2l",
            L2i => "l2i",
            I2f => "i2f",
            F2i => "f2i",
            I2d => "i2d",
            D2i => "d2i",
            Ifeq => "ifeq",
            Ifne => "ifne",
            Iflt => "iflt",
            Ifge => "ifge",
            Ifgt => "ifgt",
            Ifle => "ifle",
            IfIcmpeq => "if_icmpeq",
            IfIcmpne => "if_icmpne",
            IfIcmplt => "if_icmplt",
            IfIcmpge => "if_icmpge",
            IfIcmpgt => "if_icmpgt",
            IfIcmple => "if_icmple",
            IfAcmpeq => "if_acmpeq",
            IfAcmpne => "if_acmpne",
            Ifnull => "ifnull",
            Ifnonnull => "ifnonnull",
            Goto => "goto",
            Jsr => "jsr",
            Ret => "ret",
            Tableswitch => "tableswitch",
            Lookupswitch => "lookupswitch",
            Ireturn => "ireturn",
            Lreturn => "lreturn",
            Freturn => "freturn",
            Dreturn => "dreturn",
            Areturn => "areturn",
            Return => "return",
            Athrow => "athrow",
            Invoke => "invoke",
            New => "new",
            Getfield => "getfield",
            Putfield => "putfield",
            Newarray => "newarray",
            Arraylength => "arraylength",
            Iaload => "iaload",
            Iastore => "iastore",
            Aaload => "aaload",
            Aastore => "aastore",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
