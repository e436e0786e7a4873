//! WGSL sources for the GPU backend.
//!
//! Each function mirrors its counterpart in `crate::kernel`; keep them in
//! step when the discretisation changes.

/// Helpers shared by both solvers.
pub(super) const COMMON: &str = r#"
fn stride_of(axis: u32, dims: vec3<u32>) -> u32 {
    if (axis == 0u) {
        return 1u;
    }
    if (axis == 1u) {
        return dims.x;
    }
    return dims.x * dims.y;
}

fn forward_index(idx: u32, c: u32, n: u32, s: u32) -> u32 {
    if (c + 1u < n) {
        return idx + s;
    }
    if (c > 0u) {
        return idx - s;
    }
    return idx;
}

fn backward_index(idx: u32, c: u32, n: u32, s: u32) -> u32 {
    if (c > 0u) {
        return idx - s;
    }
    if (c + 1u < n) {
        return idx + s;
    }
    return idx;
}

fn linear_index(gid: vec3<u32>, dims: vec3<u32>) -> u32 {
    return (gid.z * dims.y + gid.y) * dims.x + gid.x;
}
"#;

pub(super) const ROF: &str = r#"
struct RofParams {
    nx: u32,
    ny: u32,
    nz: u32,
    ndim: u32,
    lambda: f32,
    tau: f32,
    eps: f32,
    min_norm: f32,
}

@group(0) @binding(0) var<storage, read> input_data: array<f32>;
@group(0) @binding(1) var<storage, read_write> u_cur: array<f32>;
@group(0) @binding(2) var<storage, read_write> flux: array<f32>;
@group(0) @binding(3) var<uniform> params: RofParams;

fn minmod(a: f32, b: f32) -> f32 {
    return 0.5 * (sign(a) + sign(b)) * min(abs(a), abs(b));
}

@compute @workgroup_size(16, 16, 1)
fn rof_flux(@builtin(global_invocation_id) gid: vec3<u32>) {
    var dims = vec3<u32>(params.nx, params.ny, params.nz);
    if (gid.x >= dims.x || gid.y >= dims.y || gid.z >= dims.z) {
        return;
    }
    var coord = gid;
    let idx = linear_index(gid, dims);
    let nd = params.ndim;
    let center = u_cur[idx];

    for (var a: u32 = 0u; a < nd; a++) {
        var numer: f32 = 0.0;
        var denom: f32 = params.eps;
        for (var b: u32 = 0u; b < nd; b++) {
            let s = stride_of(b, dims);
            let forward = u_cur[forward_index(idx, coord[b], dims[b], s)] - center;
            if (b == a) {
                numer = forward;
                denom += forward * forward;
            } else {
                let backward = center - u_cur[backward_index(idx, coord[b], dims[b], s)];
                let m = minmod(forward, backward);
                denom += m * m;
            }
        }
        flux[idx * nd + a] = numer / max(sqrt(denom), params.min_norm);
    }
}

@compute @workgroup_size(16, 16, 1)
fn rof_update(@builtin(global_invocation_id) gid: vec3<u32>) {
    var dims = vec3<u32>(params.nx, params.ny, params.nz);
    if (gid.x >= dims.x || gid.y >= dims.y || gid.z >= dims.z) {
        return;
    }
    var coord = gid;
    let idx = linear_index(gid, dims);
    let nd = params.ndim;

    var div: f32 = 0.0;
    for (var a: u32 = 0u; a < nd; a++) {
        let back = backward_index(idx, coord[a], dims[a], stride_of(a, dims));
        div += flux[idx * nd + a] - flux[back * nd + a];
    }
    let value = u_cur[idx];
    u_cur[idx] = value + params.tau * (params.lambda * div - (value - input_data[idx]));
}
"#;

pub(super) const FGP: &str = r#"
struct FgpParams {
    nx: u32,
    ny: u32,
    nz: u32,
    ndim: u32,
    lambda: f32,
    dual_step: f32,
    momentum: f32,
    flags: u32,
}

const FLAG_NONNEG: u32 = 1u;
const FLAG_ANISOTROPIC: u32 = 2u;

@group(0) @binding(0) var<storage, read> input_data: array<f32>;
@group(0) @binding(1) var<storage, read_write> u_cur: array<f32>;
@group(0) @binding(2) var<storage, read_write> u_prev: array<f32>;
@group(0) @binding(3) var<storage, read_write> r_dual: array<f32>;
@group(0) @binding(4) var<storage, read_write> p_dual: array<f32>;
@group(0) @binding(5) var<storage, read_write> p_prev: array<f32>;
@group(0) @binding(6) var<storage, read_write> partials: array<f32>;
@group(0) @binding(7) var<uniform> params: FgpParams;

@compute @workgroup_size(16, 16, 1)
fn fgp_primal(@builtin(global_invocation_id) gid: vec3<u32>) {
    var dims = vec3<u32>(params.nx, params.ny, params.nz);
    if (gid.x >= dims.x || gid.y >= dims.y || gid.z >= dims.z) {
        return;
    }
    var coord = gid;
    let idx = linear_index(gid, dims);
    let nd = params.ndim;

    var div: f32 = 0.0;
    for (var a: u32 = 0u; a < nd; a++) {
        var prev: f32 = 0.0;
        if (coord[a] > 0u) {
            prev = r_dual[(idx - stride_of(a, dims)) * nd + a];
        }
        div += r_dual[idx * nd + a] - prev;
    }
    u_prev[idx] = u_cur[idx];
    var value = input_data[idx] - params.lambda * div;
    if ((params.flags & FLAG_NONNEG) != 0u) {
        value = max(value, 0.0);
    }
    u_cur[idx] = value;
}

@compute @workgroup_size(16, 16, 1)
fn fgp_dual(@builtin(global_invocation_id) gid: vec3<u32>) {
    var dims = vec3<u32>(params.nx, params.ny, params.nz);
    if (gid.x >= dims.x || gid.y >= dims.y || gid.z >= dims.z) {
        return;
    }
    var coord = gid;
    let idx = linear_index(gid, dims);
    let nd = params.ndim;
    let center = u_cur[idx];

    var comp: array<f32, 3>;
    var norm2: f32 = 0.0;
    for (var a: u32 = 0u; a < nd; a++) {
        var grad: f32 = 0.0;
        if (coord[a] + 1u < dims[a]) {
            grad = center - u_cur[idx + stride_of(a, dims)];
        }
        let v = r_dual[idx * nd + a] + params.dual_step * grad;
        comp[a] = v;
        norm2 += v * v;
    }

    if ((params.flags & FLAG_ANISOTROPIC) != 0u) {
        for (var a: u32 = 0u; a < nd; a++) {
            p_dual[idx * nd + a] = comp[a] / max(abs(comp[a]), 1.0);
        }
    } else {
        var scale: f32 = 1.0;
        if (norm2 > 1.0) {
            scale = 1.0 / sqrt(norm2);
        }
        for (var a: u32 = 0u; a < nd; a++) {
            p_dual[idx * nd + a] = comp[a] * scale;
        }
    }
}

@compute @workgroup_size(16, 16, 1)
fn fgp_extrapolate(@builtin(global_invocation_id) gid: vec3<u32>) {
    var dims = vec3<u32>(params.nx, params.ny, params.nz);
    if (gid.x >= dims.x || gid.y >= dims.y || gid.z >= dims.z) {
        return;
    }
    let idx = linear_index(gid, dims);
    let nd = params.ndim;
    for (var a: u32 = 0u; a < nd; a++) {
        let k = idx * nd + a;
        let pk = p_dual[k];
        r_dual[k] = pk + params.momentum * (pk - p_prev[k]);
        p_prev[k] = pk;
    }
}

// One invocation per row; the host sums the partials in order.
@compute @workgroup_size(64, 1, 1)
fn fgp_residual(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let row = gid.y * groups.x * 64u + gid.x;
    if (row >= params.ny * params.nz) {
        return;
    }
    let base = row * params.nx;
    var diff: f32 = 0.0;
    var norm: f32 = 0.0;
    for (var i: u32 = 0u; i < params.nx; i++) {
        let v = u_cur[base + i];
        let d = v - u_prev[base + i];
        diff += d * d;
        norm += v * v;
    }
    partials[2u * row] = diff;
    partials[2u * row + 1u] = norm;
}
"#;
