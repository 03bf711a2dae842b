// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Session configuration: which algorithms are enabled, their manual levels,
//! and the derived physical parameter blocks handed to the accelerator.
//!
//! Client threads mutate this state through `set_ctrl`/`set_param` and the
//! worker recomputes the derived blocks through `compute`, all under the
//! engine's shared lock. The dirty mask is edge-triggered: a control change
//! sets it, exactly one subsequent `compute` pass clears it.

use crate::VppError;

/// The algorithms the accelerator pipeline can run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Algo {
    Di,
    Cnr,
    Aie,
    /// Split-screen demo: processed output on one side, untouched input on
    /// the other. Never affects buffer requirements.
    Demo,
}

pub const ALL_ALGOS: [Algo; 4] = [Algo::Di, Algo::Cnr, Algo::Aie, Algo::Demo];

/// Bitset over [`Algo`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlgoMask(u8);

impl AlgoMask {
    fn bit(algo: Algo) -> u8 {
        match algo {
            Algo::Di => 1 << 0,
            Algo::Cnr => 1 << 1,
            Algo::Aie => 1 << 2,
            Algo::Demo => 1 << 3,
        }
    }

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn from_algos(algos: &[Algo]) -> Self {
        let mut mask = Self::empty();
        for algo in algos {
            mask.insert(*algo);
        }
        mask
    }

    /// The algorithms that actually transform frame content, i.e. everything
    /// except the demo split.
    pub fn frame_algos() -> Self {
        Self::from_algos(&[Algo::Di, Algo::Cnr, Algo::Aie])
    }

    pub fn contains(&self, algo: Algo) -> bool {
        self.0 & Self::bit(algo) != 0
    }

    pub fn insert(&mut self, algo: Algo) {
        self.0 |= Self::bit(algo);
    }

    pub fn remove(&mut self, algo: Algo) {
        self.0 &= !Self::bit(algo);
    }

    pub fn intersection(&self, other: AlgoMask) -> AlgoMask {
        AlgoMask(self.0 & other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Global control mode. `Auto` turns on every supported frame algorithm with
/// tuned defaults; `Manual` hands control to the per-algorithm settings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlMode {
    Off,
    Auto,
    Manual,
}

/// Per-algorithm run mode under global manual control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AlgoRunMode {
    Off,
    Auto,
    Manual,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiMode {
    /// Spatial-only, single field buffer.
    OneField,
    /// Motion adaptive, three field-buffer window.
    ThreeField,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiControl {
    pub mode: AlgoRunMode,
    pub di_mode: DiMode,
}

pub const CNR_LEVEL_MAX: u32 = 255;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CnrControl {
    pub mode: AlgoRunMode,
    pub level: u32,
}

pub const AIE_STRENGTH_MAX: u32 = 255;
pub const AIE_SATURATION_GAIN_MAX: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AieControl {
    pub mode: AlgoRunMode,
    pub strength: u32,
    pub hue_mode: bool,
    pub saturation_gain: u32,
}

pub const DEMO_SPLIT_PERCENT_MAX: u32 = 100;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DemoSide {
    Left,
    Right,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DemoControl {
    pub enabled: bool,
    pub split_percent: u32,
    pub processed_side: DemoSide,
}

/// One `set_ctrl` request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    Mode(ControlMode),
    Di(DiControl),
    Cnr(CnrControl),
    Aie(AieControl),
    Demo(DemoControl),
}

/// Physical deinterlacer configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DiParams {
    pub three_field: bool,
}

/// Physical CNR filter strength, 0..=16.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CnrParams {
    pub filter_strength: u16,
}

const CNR_FILTER_STRENGTH_MAX: u32 = 16;

/// Physical AIE gains, 0..=128.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AieParams {
    pub ltm_gain: u16,
    pub saturation: u16,
    pub hue_enabled: bool,
}

const AIE_GAIN_MAX: u32 = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DemoParams {
    pub split_percent: u32,
    pub processed_side: DemoSide,
}

/// The parameter blocks pushed to the accelerator on every dispatch. Plain
/// `Copy` data rewritten in place by `compute`; nothing here allocates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ComputedParams {
    pub di: DiParams,
    pub cnr: CnrParams,
    pub aie: AieParams,
    pub demo: DemoParams,
}

/// Tuned defaults seeding every algorithm in auto mode. Copied into the
/// session at init and never mutated in place.
pub const AUTO_DEFAULTS: ComputedParams = ComputedParams {
    di: DiParams { three_field: true },
    cnr: CnrParams { filter_strength: 8 },
    aie: AieParams { ltm_gain: 64, saturation: 64, hue_enabled: false },
    demo: DemoParams { split_percent: 100, processed_side: DemoSide::Left },
};

/// Edge-triggered recompute marks. One bit per derived parameter block plus
/// one for the port geometry feeding the buffer-requirement negotiation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyMask(u8);

impl DirtyMask {
    const DI: u8 = 1 << 0;
    const CNR: u8 = 1 << 1;
    const AIE: u8 = 1 << 2;
    const DEMO: u8 = 1 << 3;
    const PORT_PARAMS: u8 = 1 << 4;

    pub fn all() -> Self {
        Self(Self::DI | Self::CNR | Self::AIE | Self::DEMO | Self::PORT_PARAMS)
    }

    pub fn set_algo(&mut self, algo: Algo) {
        self.0 |= match algo {
            Algo::Di => Self::DI,
            Algo::Cnr => Self::CNR,
            Algo::Aie => Self::AIE,
            Algo::Demo => Self::DEMO,
        };
    }

    pub fn set_all_algos(&mut self) {
        self.0 |= Self::DI | Self::CNR | Self::AIE | Self::DEMO;
    }

    pub fn set_port_params(&mut self) {
        self.0 |= Self::PORT_PARAMS;
    }

    pub fn port_params(&self) -> bool {
        self.0 & Self::PORT_PARAMS != 0
    }

    pub fn any(&self) -> bool {
        self.0 != 0
    }

    fn clear(&mut self) {
        self.0 = 0;
    }
}

/// The engine's owned configuration state.
pub struct ConfigState {
    /// Algorithms the accelerator build supports, fixed at init.
    caps: AlgoMask,
    pub mode: ControlMode,
    pub di: DiControl,
    pub cnr: CnrControl,
    pub aie: AieControl,
    pub demo: DemoControl,
    pub enabled: AlgoMask,
    dirty: DirtyMask,
    pub computed: ComputedParams,
    /// Enable mask as of the last `compute`, to detect requirement changes.
    last_computed_enabled: Option<AlgoMask>,
}

impl ConfigState {
    pub fn new(caps: AlgoMask) -> Self {
        Self {
            caps,
            mode: ControlMode::Off,
            di: DiControl { mode: AlgoRunMode::Off, di_mode: DiMode::ThreeField },
            cnr: CnrControl { mode: AlgoRunMode::Off, level: 0 },
            aie: AieControl {
                mode: AlgoRunMode::Off,
                strength: 0,
                hue_mode: false,
                saturation_gain: 0,
            },
            demo: DemoControl {
                enabled: false,
                split_percent: DEMO_SPLIT_PERCENT_MAX,
                processed_side: DemoSide::Left,
            },
            enabled: AlgoMask::empty(),
            dirty: DirtyMask::all(),
            computed: AUTO_DEFAULTS,
            last_computed_enabled: None,
        }
    }

    pub fn caps(&self) -> AlgoMask {
        self.caps
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.any()
    }

    pub fn mark_port_params_dirty(&mut self) {
        self.dirty.set_port_params();
    }

    /// Applies one control. All validation happens before any state is
    /// touched, so a rejected control leaves the configuration bit-identical.
    pub fn set_ctrl(&mut self, ctrl: Control) -> Result<(), VppError> {
        match &ctrl {
            Control::Mode(_) => (),
            Control::Di(c) => {
                if c.mode != AlgoRunMode::Off && !self.caps.contains(Algo::Di) {
                    return Err(VppError::Unsupported("deinterlacer not present".into()));
                }
            }
            Control::Cnr(c) => {
                if c.level > CNR_LEVEL_MAX {
                    return Err(VppError::InvalidArgument("CNR level out of range"));
                }
                if c.mode != AlgoRunMode::Off && !self.caps.contains(Algo::Cnr) {
                    return Err(VppError::Unsupported("CNR not present".into()));
                }
            }
            Control::Aie(c) => {
                if c.strength > AIE_STRENGTH_MAX {
                    return Err(VppError::InvalidArgument("AIE strength out of range"));
                }
                if c.saturation_gain > AIE_SATURATION_GAIN_MAX {
                    return Err(VppError::InvalidArgument("AIE saturation gain out of range"));
                }
                if c.mode != AlgoRunMode::Off && !self.caps.contains(Algo::Aie) {
                    return Err(VppError::Unsupported("AIE not present".into()));
                }
            }
            Control::Demo(c) => {
                if c.split_percent > DEMO_SPLIT_PERCENT_MAX {
                    return Err(VppError::InvalidArgument("demo split out of range"));
                }
            }
        }

        match ctrl {
            Control::Mode(mode) => self.set_mode(mode),
            Control::Di(c) => {
                self.require_manual()?;
                self.di = c;
                self.apply_enable(Algo::Di, c.mode != AlgoRunMode::Off);
                self.dirty.set_algo(Algo::Di);
            }
            Control::Cnr(c) => {
                self.require_manual()?;
                self.cnr = c;
                self.apply_enable(Algo::Cnr, c.mode != AlgoRunMode::Off);
                self.dirty.set_algo(Algo::Cnr);
            }
            Control::Aie(c) => {
                self.require_manual()?;
                self.aie = c;
                self.apply_enable(Algo::Aie, c.mode != AlgoRunMode::Off);
                self.dirty.set_algo(Algo::Aie);
            }
            Control::Demo(c) => {
                self.demo = c;
                self.apply_enable(Algo::Demo, c.enabled);
                self.dirty.set_algo(Algo::Demo);
            }
        }
        Ok(())
    }

    fn require_manual(&self) -> Result<(), VppError> {
        if self.mode != ControlMode::Manual {
            return Err(VppError::InvalidState("per-algorithm control requires manual mode"));
        }
        Ok(())
    }

    fn set_mode(&mut self, mode: ControlMode) {
        match mode {
            ControlMode::Off => {
                self.enabled = AlgoMask::empty();
            }
            ControlMode::Auto => {
                self.enabled = self.caps.intersection(AlgoMask::frame_algos());
            }
            ControlMode::Manual => {
                // Leaving auto must not carry auto's enable bits into manual
                // control; each algorithm has to be enabled explicitly again.
                if self.mode == ControlMode::Auto {
                    self.enabled.remove(Algo::Di);
                    self.enabled.remove(Algo::Cnr);
                    self.enabled.remove(Algo::Aie);
                }
            }
        }
        self.mode = mode;
        self.dirty.set_all_algos();
    }

    fn apply_enable(&mut self, algo: Algo, enable: bool) {
        if enable {
            self.enabled.insert(algo);
        } else {
            self.enabled.remove(algo);
        }
    }

    /// Recomputes the derived parameter blocks for every enabled algorithm and
    /// clears the dirty mask. Returns true when the buffer-requirement counts
    /// must be renegotiated with the accelerator (enable mask or port
    /// geometry changed since the previous pass).
    pub fn compute(&mut self) -> bool {
        let requirements_stale = self.dirty.port_params()
            || self.last_computed_enabled.map_or(true, |m| m != self.enabled);

        self.computed.di = if self.auto_for(self.di.mode) {
            AUTO_DEFAULTS.di
        } else {
            DiParams { three_field: self.di.di_mode == DiMode::ThreeField }
        };

        self.computed.cnr = if self.auto_for(self.cnr.mode) {
            AUTO_DEFAULTS.cnr
        } else {
            CnrParams {
                filter_strength: (self.cnr.level * CNR_FILTER_STRENGTH_MAX / CNR_LEVEL_MAX) as u16,
            }
        };

        self.computed.aie = if self.auto_for(self.aie.mode) {
            AUTO_DEFAULTS.aie
        } else {
            AieParams {
                ltm_gain: (self.aie.strength * AIE_GAIN_MAX / AIE_STRENGTH_MAX) as u16,
                saturation: (self.aie.saturation_gain * AIE_GAIN_MAX / AIE_SATURATION_GAIN_MAX)
                    as u16,
                hue_enabled: self.aie.hue_mode,
            }
        };

        self.computed.demo = DemoParams {
            split_percent: self.demo.split_percent,
            processed_side: self.demo.processed_side,
        };

        self.dirty.clear();
        self.last_computed_enabled = Some(self.enabled);
        requirements_stale
    }

    fn auto_for(&self, algo_mode: AlgoRunMode) -> bool {
        self.mode == ControlMode::Auto || algo_mode == AlgoRunMode::Auto
    }
}
