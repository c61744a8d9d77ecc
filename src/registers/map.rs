//! Register block types and bit positions for STM32F405/407 (RM0090).
//!
//! Ports, timers and DMA controllers of one kind share the first instance's
//! block type; their layouts are identical for the registers used here.

use super::device;
use core::ops::Deref;

/// Reset and clock control
pub mod rcc {
    use super::{device, Deref};

    pub type RegisterBlock = <device::RCC as Deref>::Target;

    pub mod cr {
        pub const HSION: u32 = 1 << 0;
        pub const HSIRDY: u32 = 1 << 1;
        pub const HSEON: u32 = 1 << 16;
        pub const HSERDY: u32 = 1 << 17;
        pub const HSEBYP: u32 = 1 << 18;
        pub const PLLON: u32 = 1 << 24;
        pub const PLLRDY: u32 = 1 << 25;
    }

    pub mod pllcfgr {
        pub const PLLM_SHIFT: u32 = 0;
        pub const PLLN_SHIFT: u32 = 6;
        pub const PLLP_SHIFT: u32 = 16;
        pub const PLLSRC_HSE: u32 = 1 << 22;
        pub const PLLQ_SHIFT: u32 = 24;
    }

    pub mod cfgr {
        pub const SW_SHIFT: u32 = 0;
        pub const SWS_SHIFT: u32 = 2;
        pub const SW_PLL: u32 = 0b10;
        pub const HPRE_SHIFT: u32 = 4;
        pub const PPRE1_SHIFT: u32 = 10;
        pub const PPRE2_SHIFT: u32 = 13;
    }
}

/// Embedded flash interface (wait states)
pub mod flash {
    use super::{device, Deref};

    pub type RegisterBlock = <device::FLASH as Deref>::Target;

    pub mod acr {
        pub const LATENCY_SHIFT: u32 = 0;
        pub const PRFTEN: u32 = 1 << 8;
        pub const ICEN: u32 = 1 << 9;
        pub const DCEN: u32 = 1 << 10;
    }
}

/// General-purpose I/O port
pub mod gpio {
    use super::{device, Deref};

    pub type RegisterBlock = <device::GPIOA as Deref>::Target;
}

/// External interrupt/event controller
pub mod exti {
    use super::{device, Deref};

    pub type RegisterBlock = <device::EXTI as Deref>::Target;
}

/// System configuration controller (EXTI port routing)
pub mod syscfg {
    use super::{device, Deref};

    pub type RegisterBlock = <device::SYSCFG as Deref>::Target;
}

/// I2C (v1 peripheral)
pub mod i2c {
    use super::{device, Deref};

    pub type RegisterBlock = <device::I2C1 as Deref>::Target;

    pub mod cr1 {
        pub const PE: u32 = 1 << 0;
        pub const START: u32 = 1 << 8;
        pub const STOP: u32 = 1 << 9;
        pub const ACK: u32 = 1 << 10;
        pub const POS: u32 = 1 << 11;
        pub const SWRST: u32 = 1 << 15;
    }

    pub mod cr2 {
        pub const FREQ_SHIFT: u32 = 0;
        pub const ITERREN: u32 = 1 << 8;
        pub const ITEVTEN: u32 = 1 << 9;
        pub const ITBUFEN: u32 = 1 << 10;
        pub const DMAEN: u32 = 1 << 11;
        pub const LAST: u32 = 1 << 12;
    }

    pub mod sr1 {
        pub const SB: u32 = 1 << 0;
        pub const ADDR: u32 = 1 << 1;
        pub const BTF: u32 = 1 << 2;
        pub const STOPF: u32 = 1 << 4;
        pub const RXNE: u32 = 1 << 6;
        pub const TXE: u32 = 1 << 7;
        pub const BERR: u32 = 1 << 8;
        pub const ARLO: u32 = 1 << 9;
        pub const AF: u32 = 1 << 10;
        pub const OVR: u32 = 1 << 11;
        pub const TIMEOUT: u32 = 1 << 14;
        pub const ERRORS: u32 = BERR | ARLO | AF | OVR | TIMEOUT;
    }

    pub mod sr2 {
        pub const MSL: u32 = 1 << 0;
        pub const BUSY: u32 = 1 << 1;
        pub const TRA: u32 = 1 << 2;
    }

    pub mod ccr {
        pub const DUTY: u32 = 1 << 14;
        pub const FS: u32 = 1 << 15;
    }
}

/// SPI (I2S capable) peripheral
pub mod spi {
    use super::{device, Deref};

    pub type RegisterBlock = <device::SPI1 as Deref>::Target;

    pub mod cr1 {
        pub const CPHA: u32 = 1 << 0;
        pub const CPOL: u32 = 1 << 1;
        pub const MSTR: u32 = 1 << 2;
        pub const BR_SHIFT: u32 = 3;
        pub const SPE: u32 = 1 << 6;
        pub const LSBFIRST: u32 = 1 << 7;
        pub const SSI: u32 = 1 << 8;
        pub const SSM: u32 = 1 << 9;
        pub const DFF: u32 = 1 << 11;
    }

    pub mod cr2 {
        pub const RXDMAEN: u32 = 1 << 0;
        pub const TXDMAEN: u32 = 1 << 1;
        pub const ERRIE: u32 = 1 << 5;
        pub const RXNEIE: u32 = 1 << 6;
        pub const TXEIE: u32 = 1 << 7;
    }

    pub mod sr {
        pub const RXNE: u32 = 1 << 0;
        pub const TXE: u32 = 1 << 1;
        pub const UDR: u32 = 1 << 3;
        pub const CRCERR: u32 = 1 << 4;
        pub const MODF: u32 = 1 << 5;
        pub const OVR: u32 = 1 << 6;
        pub const BSY: u32 = 1 << 7;
    }
}

/// USART/UART
pub mod usart {
    use super::{device, Deref};

    pub type RegisterBlock = <device::USART1 as Deref>::Target;

    pub mod sr {
        pub const PE: u32 = 1 << 0;
        pub const FE: u32 = 1 << 1;
        pub const NF: u32 = 1 << 2;
        pub const ORE: u32 = 1 << 3;
        pub const IDLE: u32 = 1 << 4;
        pub const RXNE: u32 = 1 << 5;
        pub const TC: u32 = 1 << 6;
        pub const TXE: u32 = 1 << 7;
        pub const LBD: u32 = 1 << 8;
    }

    pub mod cr1 {
        pub const RE: u32 = 1 << 2;
        pub const TE: u32 = 1 << 3;
        pub const IDLEIE: u32 = 1 << 4;
        pub const RXNEIE: u32 = 1 << 5;
        pub const TCIE: u32 = 1 << 6;
        pub const PEIE: u32 = 1 << 8;
        pub const PS: u32 = 1 << 9;
        pub const PCE: u32 = 1 << 10;
        pub const M: u32 = 1 << 12;
        pub const UE: u32 = 1 << 13;
    }

    pub mod cr2 {
        pub const LBDIE: u32 = 1 << 6;
        pub const STOP_SHIFT: u32 = 12;
        pub const LINEN: u32 = 1 << 14;
    }

    pub mod cr3 {
        pub const EIE: u32 = 1 << 0;
        pub const DMAR: u32 = 1 << 6;
        pub const DMAT: u32 = 1 << 7;
    }
}

/// 12-bit successive approximation ADC
pub mod adc {
    use super::{device, Deref};

    pub type RegisterBlock = <device::ADC1 as Deref>::Target;

    pub type CommonRegisterBlock = <device::ADC_COMMON as Deref>::Target;

    pub mod sr {
        pub const EOC: u32 = 1 << 1;
        pub const STRT: u32 = 1 << 4;
        pub const OVR: u32 = 1 << 5;
    }

    pub mod cr1 {
        pub const SCAN: u32 = 1 << 8;
        pub const RES_SHIFT: u32 = 24;
        pub const OVRIE: u32 = 1 << 26;
    }

    pub mod cr2 {
        pub const ADON: u32 = 1 << 0;
        pub const CONT: u32 = 1 << 1;
        pub const DMA: u32 = 1 << 8;
        pub const DDS: u32 = 1 << 9;
        pub const EOCS: u32 = 1 << 10;
        pub const ALIGN: u32 = 1 << 11;
        pub const SWSTART: u32 = 1 << 30;
    }

    pub mod ccr {
        pub const ADCPRE_SHIFT: u32 = 16;
    }
}

/// DMA controller with eight streams
pub mod dma {
    use super::{device, Deref};

    /// One stream's CR, NDTR, PAR, M0AR, M1AR and FCR
    pub type StreamRegisters = device::dma2::ST;

    pub type RegisterBlock = <device::DMA2 as Deref>::Target;

    pub mod cr {
        pub const EN: u32 = 1 << 0;
        pub const DMEIE: u32 = 1 << 1;
        pub const TEIE: u32 = 1 << 2;
        pub const HTIE: u32 = 1 << 3;
        pub const TCIE: u32 = 1 << 4;
        pub const DIR_SHIFT: u32 = 6;
        pub const CIRC: u32 = 1 << 8;
        pub const PINC: u32 = 1 << 9;
        pub const MINC: u32 = 1 << 10;
        pub const PSIZE_SHIFT: u32 = 11;
        pub const MSIZE_SHIFT: u32 = 13;
        pub const PL_SHIFT: u32 = 16;
        pub const CHSEL_SHIFT: u32 = 25;
    }

    /// Flag positions inside the 6-bit group of one stream in xISR/xIFCR
    pub mod isr {
        pub const FEIF: u32 = 1 << 0;
        pub const DMEIF: u32 = 1 << 2;
        pub const TEIF: u32 = 1 << 3;
        pub const HTIF: u32 = 1 << 4;
        pub const TCIF: u32 = 1 << 5;
        pub const ALL: u32 = FEIF | DMEIF | TEIF | HTIF | TCIF;
    }
}

/// General-purpose and advanced-control timers (TIM1 superset layout)
pub mod tim {
    use super::{device, Deref};

    pub type RegisterBlock = <device::TIM1 as Deref>::Target;

    pub mod cr1 {
        pub const CEN: u32 = 1 << 0;
        pub const URS: u32 = 1 << 2;
        pub const DIR: u32 = 1 << 4;
        pub const CMS_SHIFT: u32 = 5;
        pub const ARPE: u32 = 1 << 7;
    }

    pub mod dier {
        pub const UIE: u32 = 1 << 0;
        pub const UDE: u32 = 1 << 8;
    }

    pub mod sr {
        pub const UIF: u32 = 1 << 0;
        /// CCxIF for channel index 0..=3
        pub const fn ccif(ch: u32) -> u32 {
            1 << (1 + ch)
        }
        /// CCxOF for channel index 0..=3
        pub const fn ccof(ch: u32) -> u32 {
            1 << (9 + ch)
        }
    }

    pub mod egr {
        pub const UG: u32 = 1 << 0;
    }

    pub mod bdtr {
        pub const MOE: u32 = 1 << 15;
    }
}
