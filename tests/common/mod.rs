#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use calculix_runner::error::{FeaError, FeaResult};
use calculix_runner::mesh::{MeshArtifacts, MeshConnectivity};
use calculix_runner::mesher::{MeshPort, MeshRequest};
use calculix_runner::models::CandidateRecord;
use calculix_runner::solver::{LineSink, SolveOutcome, SolverPort};
use calculix_runner::RunConfig;

/// Node and element ids of call `n` start at `(n - 1) * ID_STRIDE + 1`, so
/// every re-mesh numbers its nodes differently.
pub const ID_STRIDE: usize = 100;

const COORDS: [[f64; 3]; 4] = [
    [0.0, 0.0, 0.0],
    [10.0, 0.0, 0.0],
    [0.0, 10.0, 0.0],
    [0.0, 0.0, 10.0],
];

pub fn node_ids(call: usize) -> Vec<usize> {
    let base = (call - 1) * ID_STRIDE;
    (1..=COORDS.len()).map(|i| base + i).collect()
}

/// Writes a one-tetrahedron mesh, renumbered per call; fails on the configured call.
#[derive(Default)]
pub struct FakeMesher {
    pub calls: AtomicUsize,
    pub fail_on_call: Option<usize>,
}

impl MeshPort for FakeMesher {
    async fn generate(&self, _request: &MeshRequest, work_dir: &Path) -> FeaResult<MeshArtifacts> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(FeaError::Mesher("mesher crashed".to_string()));
        }
        let ids = node_ids(call);
        let element = (call - 1) * ID_STRIDE + 1;

        let mut mesh = String::from("*NODE, NSET=NALL_MESH\n");
        let mut table = String::from("ID,X,Y,Z\n");
        for (id, [x, y, z]) in ids.iter().zip(COORDS) {
            mesh.push_str(&format!("{}, {:.1}, {:.1}, {:.1}\n", id, x, y, z));
            table.push_str(&format!("{},{},{},{}\n", id, x, y, z));
        }
        mesh.push_str("*ELEMENT, TYPE=C3D4, ELSET=SOLID\n");
        mesh.push_str(&format!("{}, {}, {}, {}, {}\n", element, ids[0], ids[1], ids[2], ids[3]));

        fs::create_dir_all(work_dir)?;
        let artifacts = MeshArtifacts::in_dir(work_dir);
        fs::write(&artifacts.mesh_file, mesh)?;
        fs::write(&artifacts.node_table, table)?;
        fs::write(
            &artifacts.groups_file,
            format!(r#"{{"SUPPORT": [{}, {}, {}], "LOAD": [{}]}}"#, ids[0], ids[2], ids[3], ids[1]),
        )?;
        fs::write(&artifacts.stats_file, r#"{"node_count": 4, "element_count": 1}"#)?;
        Ok(artifacts)
    }
}

/// What the fake solver does on a static solve.
#[derive(Debug, Clone, Copy)]
pub enum Solve {
    /// Report with the mesh's element under uniaxial stress of this magnitude
    Stress(f64),
    /// Successful exit but an empty report
    EmptyReport,
    /// Non-zero exit
    Crash,
}

pub struct FakeSolver {
    pub script: Vec<Solve>,
    pub static_calls: AtomicUsize,
    pub buckling_calls: AtomicUsize,
    pub fail_buckling: bool,
}

impl FakeSolver {
    pub fn new(script: Vec<Solve>) -> Self {
        Self {
            script,
            static_calls: AtomicUsize::new(0),
            buckling_calls: AtomicUsize::new(0),
            fail_buckling: false,
        }
    }
}

fn stress_report(mesh: &MeshConnectivity, stress: f64) -> String {
    let n = &mesh.node_ids;
    let element = mesh.elements[0].id;
    format!(
        "
                        S T E P       1

 displacements (vx,vy,vz) for set NALL and time  0.1000000E+01

 {n0:>9}  0.000000E+00  0.000000E+00  0.000000E+00
 {n1:>9}  1.000000E-02  0.000000E+00 -2.000000E-02
 {n2:>9}  0.000000E+00  0.000000E+00  0.000000E+00
 {n3:>9}  0.000000E+00  0.000000E+00  0.000000E+00

 forces (fx,fy,fz) for set SUPPORT and time  0.1000000E+01

 {n0:>9} -1.000000E+03  0.000000E+00  0.000000E+00
 {n2:>9}  0.000000E+00  0.000000E+00  0.000000E+00

 displacements (vx,vy,vz) for set LOAD and time  0.1000000E+01

 {n1:>9}  1.000000E-02  0.000000E+00 -2.000000E-02

 stresses (elem, integ.pnt.,sxx,syy,szz,sxy,sxz,syz) for set EALL and time  0.1000000E+01

 {element:>9}   1  {stress:.6E}  0.000000E+00  0.000000E+00  0.000000E+00  0.000000E+00  0.000000E+00

                        S T E P       2

     B U C K L I N G   F A C T O R   O U T P U T

 MODE NO       BUCKLING
                FACTOR

      1   0.1500000E+02
      2   0.3100000E+02
",
        n0 = n[0],
        n1 = n[1],
        n2 = n[2],
        n3 = n[3],
        element = element,
        stress = stress
    )
}

const BUCKLING_REPORT: &str = "
                        S T E P       1

     B U C K L I N G   F A C T O R   O U T P U T

 MODE NO       BUCKLING
                FACTOR

      1   0.1450000E+02
      2   0.3000000E+02
      3   0.4200000E+02
";

impl SolverPort for FakeSolver {
    async fn run(
        &self,
        deck: &Path,
        work_dir: &Path,
        _threads: usize,
        on_line: LineSink<'_>,
    ) -> SolveOutcome {
        let job = deck.file_stem().unwrap().to_string_lossy().to_string();
        let report = work_dir.join(format!("{}.dat", job));
        let text = fs::read_to_string(deck).unwrap();
        on_line(&format!("ccx {}", job));

        if !text.contains("*STATIC") {
            self.buckling_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_buckling {
                return SolveOutcome::failed(report);
            }
            fs::write(&report, BUCKLING_REPORT).unwrap();
            return SolveOutcome {
                success: true,
                exit_code: Some(0),
                report,
            };
        }

        let call = self.static_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.get(call).copied().unwrap_or(Solve::Crash) {
            Solve::Stress(s) => {
                let mesh = MeshConnectivity::parse(&text);
                fs::write(&report, stress_report(&mesh, s)).unwrap()
            }
            Solve::EmptyReport => fs::write(&report, "\n").unwrap(),
            Solve::Crash => {
                on_line("*ERROR: singular matrix");
                return SolveOutcome {
                    success: false,
                    exit_code: Some(201),
                    report,
                };
            }
        }
        SolveOutcome {
            success: true,
            exit_code: Some(0),
            report,
        }
    }
}

pub fn candidate(profile: &str) -> CandidateRecord {
    serde_json::from_value(serde_json::json!({
        "profile_name": profile,
        "length": 10.0,
        "profile_height": 100.0,
        "profile_width": 50.0,
        "web_thickness": 6.0,
        "flange_thickness": 8.5,
        "plate_thickness": 10.0,
        "plate_width": 200.0,
        "material": "S355",
        "axial_force": 1000.0,
        "moment_y": 5000.0
    }))
    .unwrap()
}

pub fn config(root: &Path) -> RunConfig {
    RunConfig {
        tolerance: 0.02,
        max_iterations: 5,
        initial_mesh_size: 10.0,
        refinement_factor: 0.5,
        station_step: 5.0,
        work_dir: root.join("work"),
        archive_dir: root.join("archive"),
        ..RunConfig::default()
    }
}
