use salvo::catcher::Catcher;
use salvo::cors::Cors;
use salvo::http::Method;

use crate::auth::SharedAuthVerifier;
use crate::prelude::*;

const OPENAPI_JSON: &str = "/api-doc/openapi.json";

pub fn root(auth_verifier: SharedAuthVerifier, cors_origin: &str) -> Router {
    let inject_auth = inject_auth_hoop(auth_verifier);

    let api_routes = Router::with_path("api")
        .hoop(crate::utils::logger::Logger)
        .push(Router::with_path("healthz").get(healthz))
        .push(
            Router::with_path("ws")
                .hoop(inject_auth)
                .goal(crate::ws::connect),
        );

    let cors = Cors::new()
        .allow_origin(cors_origin)
        .allow_methods(vec![Method::GET])
        .into_handler();

    let doc = openapi_doc(&api_routes);

    Router::new()
        .hoop(cors)
        .push(api_routes)
        .unshift(doc.into_router(OPENAPI_JSON))
        .unshift(Scalar::new(OPENAPI_JSON).into_router("scalar"))
}

/// Stashes the auth verifier in the depot so [`crate::ws::connect`] can pull
/// it back out without threading it through every router function.
fn inject_auth_hoop(verifier: SharedAuthVerifier) -> impl Handler {
    InjectAuthVerifier(verifier)
}

struct InjectAuthVerifier(SharedAuthVerifier);

#[async_trait]
impl Handler for InjectAuthVerifier {
    async fn handle(
        &self,
        _req: &mut Request,
        depot: &mut Depot,
        _res: &mut Response,
        _ctrl: &mut FlowCtrl,
    ) {
        depot.insert("auth_verifier", self.0.clone());
    }
}

#[handler]
async fn healthz() -> &'static str {
    "ok"
}

pub fn catcher() -> Catcher {
    Catcher::default()
}

fn openapi_doc(to_document: &Router) -> OpenApi {
    OpenApi::new("Crew Broker", "0.1.0").merge_router(to_document)
}
