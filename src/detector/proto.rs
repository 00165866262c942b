//! Client and messages for `yolo.YoloService`, generated from
//! `proto/yolo_service.proto`.

tonic::include_proto!("yolo");
