use crate::model::{CellModel, Variables};

/// The Luo-Rudy 1991 ventricular action potential model.
///
/// Hand-compiled from the published equations (Luo & Rudy, Circ Res 1991):
/// eight states, twenty-seven intermediary variables and seventeen literal
/// constants. The stimulus current is driven by the first pacing channel
/// scaled by the `membrane.stim_amplitude` literal. No sensitivity
/// parameters are declared.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lr1991;

impl Lr1991 {
    pub fn new() -> Self {
        Self
    }
}

const STATE_NAMES: &[&str] = &[
    "membrane.V",
    "ina.m",
    "ina.h",
    "ina.j",
    "ica.d",
    "ica.f",
    "ik.x",
    "ica.Ca_i",
];

const INTERMEDIARY_NAMES: &[&str] = &[
    "membrane.i_ion",
    "membrane.i_stim",
    "ik.x.alpha",
    "ik.x.beta",
    "ik.xi",
    "ik.IK",
    "ina.a",
    "ina.m.alpha",
    "ina.m.beta",
    "ina.h.alpha",
    "ina.h.beta",
    "ina.j.alpha",
    "ina.j.beta",
    "ina.INa",
    "ikp.Kp",
    "ikp.IKp",
    "ica.E",
    "ica.d.alpha",
    "ica.d.beta",
    "ica.f.alpha",
    "ica.f.beta",
    "ica.ICa",
    "ik1.g",
    "ik1.g.alpha",
    "ik1.g.beta",
    "ik1.IK1",
    "ib.Ib",
];

// State indices.
const V: usize = 0;
const M: usize = 1;
const H: usize = 2;
const J: usize = 3;
const D: usize = 4;
const F: usize = 5;
const X: usize = 6;
const CA_I: usize = 7;

// Literal indices.
const CA_O: usize = 0;
const K_I: usize = 1;
const K_O: usize = 2;
const NA_I: usize = 3;
const NA_O: usize = 4;
const FARADAY: usize = 5;
const GAS: usize = 6;
const TEMP: usize = 7;
const EB: usize = 8;
const GB: usize = 9;
const GCA: usize = 10;
const PNA_K: usize = 11;
const GNA: usize = 12;
const GKP: usize = 13;
const CM: usize = 14;
const I_DIFF: usize = 15;
const STIM_AMPLITUDE: usize = 16;

// Literal-derived indices.
const RTF: usize = 0;
const GK: usize = 1;
const IK_E: usize = 2;
const IK1_E: usize = 3;
const GK1: usize = 4;
const ENA: usize = 5;

impl CellModel for Lr1991 {
    fn name(&self) -> &str {
        "lr1991"
    }

    fn n_states(&self) -> usize {
        8
    }

    fn n_intermediary(&self) -> usize {
        27
    }

    fn n_literals(&self) -> usize {
        17
    }

    fn n_literal_derived(&self) -> usize {
        6
    }

    fn state_names(&self) -> &[&str] {
        STATE_NAMES
    }

    fn intermediary_names(&self) -> &[&str] {
        INTERMEDIARY_NAMES
    }

    fn initial_states(&self) -> Vec<f64> {
        vec![-84.5286, 0.0017, 0.9832, 0.995484, 3e-6, 1.0, 0.0057, 0.0002]
    }

    fn default_literals(&self) -> Vec<f64> {
        vec![
            1.8,      // ica.Ca_o
            145.0,    // cell.K_i
            5.4,      // cell.K_o
            10.0,     // cell.Na_i
            140.0,    // cell.Na_o
            96500.0,  // cell.F
            8314.0,   // cell.R
            310.0,    // cell.T
            -59.87,   // ib.Eb
            0.03921,  // ib.gb
            0.09,     // ica.gCa
            0.01833,  // ik.PNa_K
            16.0,     // ina.gNa
            0.0183,   // ikp.gKp
            1.0,      // membrane.C
            0.0,      // membrane.i_diff
            -80.0,    // membrane.stim_amplitude
        ]
    }

    fn evaluate_literal_derived(&self, vars: &mut Variables) {
        let c = &vars.literals;
        let rtf = c[GAS] * c[TEMP] / c[FARADAY];
        let d = &mut vars.literal_derived;
        d[RTF] = rtf;
        d[GK] = 0.282 * (c[K_O] / 5.4).sqrt();
        d[IK_E] = rtf
            * ((c[K_O] + c[PNA_K] * c[NA_O]) / (c[K_I] + c[PNA_K] * c[NA_I])).ln();
        d[IK1_E] = rtf * (c[K_O] / c[K_I]).ln();
        d[GK1] = 0.6047 * (c[K_O] / 5.4).sqrt();
        d[ENA] = rtf * (c[NA_O] / c[NA_I]).ln();
    }

    fn evaluate_derivatives(&self, vars: &mut Variables) {
        let v = vars.states[V];
        let m = vars.states[M];
        let h = vars.states[H];
        let j = vars.states[J];
        let d = vars.states[D];
        let f = vars.states[F];
        let x = vars.states[X];
        let ca_i = vars.states[CA_I];
        let pace = vars.bound.pace.first().copied().unwrap_or(0.0);
        let c = &vars.literals;
        let ld = &vars.literal_derived;

        // ib
        let i_b = c[GB] * (v - c[EB]);

        // ica
        let ica_e = 7.7 - 13.0287 * (ca_i / c[CA_O]).ln();
        let d_alpha = 0.095 * ((-0.01) * (v - 5.0)).exp() / (1.0 + ((-0.072) * (v - 5.0)).exp());
        let d_beta = 0.07 * ((-0.017) * (v + 44.0)).exp() / (1.0 + (0.05 * (v + 44.0)).exp());
        let dot_d = d_alpha * (1.0 - d) - d_beta * d;
        let f_alpha = 0.012 * ((-0.008) * (v + 28.0)).exp() / (1.0 + (0.15 * (v + 28.0)).exp());
        let f_beta = 0.0065 * ((-0.02) * (v + 30.0)).exp() / (1.0 + ((-0.2) * (v + 30.0)).exp());
        let dot_f = f_alpha * (1.0 - f) - f_beta * f;
        let i_ca = c[GCA] * d * f * (v - ica_e);
        let dot_ca_i = (-0.0001) * i_ca + 0.07 * (0.0001 - ca_i);

        // ik
        let xi = if v < -100.0 {
            1.0
        } else if v == -77.0 {
            2.837 * 0.04 / (0.04 * (v + 35.0)).exp()
        } else {
            2.837 * ((0.04 * (v + 77.0)).exp() - 1.0) / ((v + 77.0) * (0.04 * (v + 35.0)).exp())
        };
        let x_alpha = 0.0005 * (0.083 * (v + 50.0)).exp() / (1.0 + (0.057 * (v + 50.0)).exp());
        let x_beta = 0.0013 * ((-0.06) * (v + 20.0)).exp() / (1.0 + ((-0.04) * (v + 20.0)).exp());
        let dot_x = x_alpha * (1.0 - x) - x_beta * x;
        let i_k = ld[GK] * xi * x * (v - ld[IK_E]);

        // ik1
        let g_alpha = 1.02 / (1.0 + (0.2385 * (v - ld[IK1_E] - 59.215)).exp());
        let g_beta = (0.49124 * (0.08032 * (v - ld[IK1_E] + 5.476)).exp()
            + 1.0 * (0.06175 * (v - ld[IK1_E] - 594.31)).exp())
            / (1.0 + ((-0.5143) * (v - ld[IK1_E] + 4.753)).exp());
        let g = g_alpha / (g_alpha + g_beta);
        let i_k1 = ld[GK1] * g * (v - ld[IK1_E]);

        // ina
        let a = 1.0 - 1.0 / (1.0 + ((-(v + 40.0)) / 0.24).exp());
        let m_alpha = 0.32 * (v + 47.13) / (1.0 - ((-0.1) * (v + 47.13)).exp());
        let m_beta = 0.08 * ((-v) / 11.0).exp();
        let dot_m = m_alpha * (1.0 - m) - m_beta * m;
        let i_na = c[GNA] * m.powi(3) * h * j * (v - ld[ENA]);
        let h_alpha = a * 0.135 * ((80.0 + v) / (-6.8)).exp();
        let h_beta = a * (3.56 * (0.079 * v).exp() + 310000.0 * (0.35 * v).exp())
            + (1.0 - a) / (0.13 * (1.0 + ((v + 10.66) / (-11.1)).exp()));
        let dot_h = h_alpha * (1.0 - h) - h_beta * h;
        let j_alpha = a
            * ((-127140.0) * (0.2444 * v).exp() - 3.474e-5 * ((-0.04391) * v).exp())
            * (v + 37.78)
            / (1.0 + (0.311 * (v + 79.23)).exp());
        let j_beta = a * (0.1212 * ((-0.01052) * v).exp() / (1.0 + ((-0.1378) * (v + 40.14)).exp()))
            + (1.0 - a) * (0.3 * ((-2.535e-7) * v).exp() / (1.0 + ((-0.1) * (v + 32.0)).exp()));
        let dot_j = j_alpha * (1.0 - j) - j_beta * j;

        // ikp
        let kp = 1.0 / (1.0 + ((7.488 - v) / 5.98).exp());
        let i_kp = c[GKP] * kp * (v - ld[IK1_E]);

        // membrane
        let i_ion = i_na + i_k + i_b + i_kp + i_k1 + i_ca;
        let i_stim = pace * c[STIM_AMPLITUDE];
        let dot_v = (-(1.0 / c[CM])) * (i_ion + c[I_DIFF] + i_stim);

        let w = &mut vars.intermediary;
        w[0] = i_ion;
        w[1] = i_stim;
        w[2] = x_alpha;
        w[3] = x_beta;
        w[4] = xi;
        w[5] = i_k;
        w[6] = a;
        w[7] = m_alpha;
        w[8] = m_beta;
        w[9] = h_alpha;
        w[10] = h_beta;
        w[11] = j_alpha;
        w[12] = j_beta;
        w[13] = i_na;
        w[14] = kp;
        w[15] = i_kp;
        w[16] = ica_e;
        w[17] = d_alpha;
        w[18] = d_beta;
        w[19] = f_alpha;
        w[20] = f_beta;
        w[21] = i_ca;
        w[22] = g;
        w[23] = g_alpha;
        w[24] = g_beta;
        w[25] = i_k1;
        w[26] = i_b;

        let dy = &mut vars.derivatives;
        dy[V] = dot_v;
        dy[M] = dot_m;
        dy[H] = dot_h;
        dy[J] = dot_j;
        dy[D] = dot_d;
        dy[F] = dot_f;
        dy[X] = dot_x;
        dy[CA_I] = dot_ca_i;
    }
}
