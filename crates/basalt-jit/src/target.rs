//! Target register model
//!
//! Describes the register files and calling convention the code generator
//! targets. Register numbers are abstract; the backend maps them to machine
//! registers.

/// Register file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Int,
    Float,
}

/// Machine register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub class: RegClass,
    pub num: u8,
}

impl Reg {
    pub const fn int(num: u8) -> Self {
        Reg {
            class: RegClass::Int,
            num,
        }
    }

    pub const fn float(num: u8) -> Self {
        Reg {
            class: RegClass::Float,
            num,
        }
    }

    pub fn is_float(self) -> bool {
        self.class == RegClass::Float
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.class {
            RegClass::Int => write!(f, "r{}", self.num),
            RegClass::Float => write!(f, "f{}", self.num),
        }
    }
}

/// Target information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub name: &'static str,
    /// Bytes per pointer and per switch-table entry
    pub pointer_size: u8,
    /// Integer and reference return values
    pub int_return: Reg,
    pub float_return: Reg,
    /// Holds the thrown object on handler entry
    pub exception_reg: Reg,
    /// Caller-saved temporaries; index 2 is reserved for stack flushes
    pub int_scratch: [Reg; 3],
    pub float_scratch: [Reg; 3],
    /// Callee-saved registers, including the frame base
    pub callee_saved_int: Vec<Reg>,
    pub callee_saved_float: Vec<Reg>,
    pub frame_base: Reg,
    pub stack_pointer: Reg,
    /// Integer registers can hold a `long`
    pub wide_int_regs: bool,
    /// Float registers can hold a `double`
    pub wide_float_regs: bool,
    pub array_length_offset: i32,
    pub array_data_offset: i32,
}

impl TargetInfo {
    /// 64-bit portable target
    pub fn portable64() -> Self {
        TargetInfo {
            name: "portable64",
            pointer_size: 8,
            int_return: Reg::int(0),
            float_return: Reg::float(0),
            exception_reg: Reg::int(0),
            int_scratch: [Reg::int(1), Reg::int(2), Reg::int(3)],
            float_scratch: [Reg::float(1), Reg::float(2), Reg::float(3)],
            callee_saved_int: (8..=14).map(Reg::int).collect(),
            callee_saved_float: (8..=13).map(Reg::float).collect(),
            frame_base: Reg::int(14),
            stack_pointer: Reg::int(15),
            wide_int_regs: true,
            wide_float_regs: true,
            array_length_offset: 8,
            array_data_offset: 16,
        }
    }

    /// 32-bit portable target: `long` values never live in registers
    pub fn portable32() -> Self {
        TargetInfo {
            name: "portable32",
            pointer_size: 4,
            wide_int_regs: false,
            array_length_offset: 4,
            array_data_offset: 8,
            callee_saved_int: (10..=14).map(Reg::int).collect(),
            ..Self::portable64()
        }
    }

    /// Scratch register `index` of the class that holds `float` values or not
    pub fn scratch(&self, float: bool, index: usize) -> Reg {
        if float {
            self.float_scratch[index]
        } else {
            self.int_scratch[index]
        }
    }
}
